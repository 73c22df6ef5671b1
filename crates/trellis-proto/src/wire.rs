//! Protobuf message definitions.
//!
//! Hand-written `prost` derives instead of generated code: the schema is
//! small and this keeps the build free of a protoc dependency. Field
//! numbers are load-bearing; they must not change.

/// An end-to-end encrypted signaling message, routed by the broker from
/// `sender` to every subscriber of `recipient`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Sender's Curve25519 public key (32 bytes).
    #[prost(bytes = "vec", tag = "1")]
    pub sender: Vec<u8>,

    /// Recipient's Curve25519 public key (32 bytes).
    #[prost(bytes = "vec", tag = "2")]
    pub recipient: Vec<u8>,

    /// Sealed [`Message`].
    #[prost(message, optional, tag = "3")]
    pub contents: Option<EncryptedMessage>,
}

/// NaCl-box output of a serialized [`Message`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptedMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub body: Vec<u8>,

    /// Random box nonce, exactly 24 bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
}

/// Plaintext signaling payload. At least one field is set; the fields are
/// independent options rather than a oneof so a single message can carry
/// several payloads at once.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(message, optional, tag = "1")]
    pub credentials: Option<Credentials>,

    #[prost(message, optional, tag = "2")]
    pub candidate: Option<Candidate>,

    #[prost(message, optional, tag = "3")]
    pub peer: Option<PeerDescription>,

    #[prost(message, optional, tag = "4")]
    pub pske: Option<PresharedKeyEstablishment>,
}

/// ICE credentials of the sending peer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Credentials {
    /// ICE username fragment.
    #[prost(string, tag = "1")]
    pub ufrag: String,

    /// ICE password.
    #[prost(string, tag = "2")]
    pub pwd: String,

    /// Set when the sender asks the receiver to send its own credentials
    /// back.
    #[prost(bool, tag = "3")]
    pub need_creds: bool,
}

/// A single ICE endpoint candidate.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Candidate {
    #[prost(enumeration = "candidate::Kind", tag = "1")]
    pub kind: i32,

    #[prost(string, tag = "2")]
    pub foundation: String,

    #[prost(int32, tag = "3")]
    pub component: i32,

    #[prost(enumeration = "candidate::NetworkType", tag = "4")]
    pub network_type: i32,

    #[prost(int32, tag = "5")]
    pub priority: i32,

    #[prost(string, tag = "6")]
    pub address: String,

    #[prost(int32, tag = "7")]
    pub port: i32,

    #[prost(enumeration = "candidate::TcpType", tag = "8")]
    pub tcp_type: i32,

    #[prost(message, optional, tag = "9")]
    pub related_address: Option<RelatedAddress>,
}

pub mod candidate {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Kind {
        Unspecified = 0,
        Host = 1,
        ServerReflexive = 2,
        PeerReflexive = 3,
        Relay = 4,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum NetworkType {
        Unspecified = 0,
        Udp4 = 1,
        Udp6 = 2,
        Tcp4 = 3,
        Tcp6 = 4,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum TcpType {
        Unspecified = 0,
        Active = 1,
        Passive = 2,
        SimultaneousOpen = 3,
    }
}

/// Related address of reflexive and relayed candidates.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RelatedAddress {
    #[prost(string, tag = "1")]
    pub address: String,

    #[prost(int32, tag = "2")]
    pub port: i32,
}

/// A change to the sender's peer-level description.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerDescription {
    #[prost(enumeration = "peer_description::Change", tag = "1")]
    pub change: i32,

    /// Human-readable peer name.
    #[prost(string, tag = "2")]
    pub name: String,

    #[prost(bytes = "vec", tag = "3")]
    pub public_key: Vec<u8>,

    /// Replacement key when the peer rotates its identity.
    #[prost(bytes = "vec", tag = "4")]
    pub public_key_new: Vec<u8>,

    /// Allowed IP networks in CIDR notation.
    #[prost(string, repeated, tag = "5")]
    pub allowed_ips: Vec<String>,
}

pub mod peer_description {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Change {
        Unspecified = 0,
        Add = 1,
        Remove = 2,
        Update = 3,
    }
}

/// Half of a pre-shared key establishment: an ephemeral public key plus
/// the ciphertext of the key share.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PresharedKeyEstablishment {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,

    #[prost(bytes = "vec", tag = "2")]
    pub cipher_text: Vec<u8>,
}

/// Parameters of a broker subscription: the public key whose topic to
/// follow.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeParams {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

/// A STUN/TURN server usable by the requesting peer, with credentials
/// where the server requires them.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RelayInfo {
    #[prost(string, tag = "1")]
    pub url: String,

    #[prost(string, tag = "2")]
    pub username: String,

    #[prost(string, tag = "3")]
    pub password: String,

    /// Unset for static credentials and plain STUN.
    #[prost(message, optional, tag = "4")]
    pub expires: Option<::prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRelaysParams {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRelaysResp {
    #[prost(message, repeated, tag = "1")]
    pub relays: Vec<RelayInfo>,
}

/// Client-to-broker request frame. `seq` correlates the broker's reply
/// frame with the request; it is never zero.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientFrame {
    #[prost(uint64, tag = "1")]
    pub seq: u64,

    #[prost(oneof = "client_frame::Body", tags = "2, 3, 4, 5")]
    pub body: Option<client_frame::Body>,
}

pub mod client_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Open a subscription stream for a recipient key.
        #[prost(message, tag = "2")]
        Subscribe(super::SubscribeParams),

        /// Cancel the subscription stream for a recipient key.
        #[prost(message, tag = "3")]
        Unsubscribe(super::SubscribeParams),

        /// Publish an envelope to its recipient's topic.
        #[prost(message, tag = "4")]
        Publish(super::Envelope),

        /// Request relay servers and credentials.
        #[prost(message, tag = "5")]
        GetRelays(super::GetRelaysParams),
    }
}

/// Broker-to-client frame. Replies carry the request's `seq`; envelope
/// deliveries are unsolicited and carry `seq == 0`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerFrame {
    #[prost(uint64, tag = "1")]
    pub seq: u64,

    #[prost(oneof = "server_frame::Body", tags = "2, 3, 4, 5")]
    pub body: Option<server_frame::Body>,
}

pub mod server_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Positive acknowledgment. For a Subscribe request this is the
        /// synchronization envelope: once received, the subscription is
        /// installed and no Publish can race past it.
        #[prost(message, tag = "2")]
        Ack(super::Ack),

        /// An envelope delivered to one of this connection's
        /// subscriptions.
        #[prost(message, tag = "3")]
        Envelope(super::Envelope),

        #[prost(message, tag = "4")]
        Relays(super::GetRelaysResp),

        #[prost(message, tag = "5")]
        Error(super::ErrorInfo),
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Ack {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorInfo {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,

    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unspecified = 0,
    InvalidArgument = 1,
    Internal = 2,
}
