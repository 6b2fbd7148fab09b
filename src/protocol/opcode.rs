//! Opcode vocabulary - the closed set of remotely invokable operations.
//!
//! Each remote operation is identified by a one-byte opcode. The set is
//! fixed at compile time on both peers; an out-of-range byte on the server
//! side is reported back to the caller as a fault ("bad method code") and
//! then tears the connection down.

use crate::error::MqwireError;

/// One-byte operation identifier.
///
/// Values 1..=20 are client-to-server requests on the sync channel; values
/// from 64 up are server-to-client pushes on the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // Handshake and session lifecycle.
    Authenticate = 1,
    CheckUser = 2,
    GetId = 3,
    CheckId = 4,
    ConnectionClosing = 5,

    // Destination management.
    CreateQueue = 6,
    CreateTopic = 7,
    GetTemporaryQueue = 8,
    GetTemporaryTopic = 9,
    DeleteTemporaryDestination = 10,

    // Messaging.
    AddMessage = 11,
    Receive = 12,
    Browse = 13,
    Subscribe = 14,
    Unsubscribe = 15,
    DestroySubscription = 16,
    Acknowledge = 17,
    Transact = 18,
    SetEnabled = 19,

    /// Fire-and-forget liveness probe. The one opcode with no reply frame:
    /// waiting for one could deadlock two peers pinging each other while
    /// both hold their call lock.
    Ping = 20,

    // Push channel (server to client).
    Deliver = 64,
    PushPing = 65,
}

impl Opcode {
    /// Whether this opcode travels on the push channel.
    pub fn is_push(self) -> bool {
        (self as u8) >= Opcode::Deliver as u8
    }

    /// Whether a request with this opcode elicits a reply frame.
    pub fn expects_reply(self) -> bool {
        !matches!(self, Opcode::Ping) && !self.is_push()
    }

    /// Whether this opcode may be issued before a session token exists.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Opcode::Authenticate | Opcode::CheckUser | Opcode::GetId | Opcode::CheckId | Opcode::Ping
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = MqwireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Opcode::Authenticate,
            2 => Opcode::CheckUser,
            3 => Opcode::GetId,
            4 => Opcode::CheckId,
            5 => Opcode::ConnectionClosing,
            6 => Opcode::CreateQueue,
            7 => Opcode::CreateTopic,
            8 => Opcode::GetTemporaryQueue,
            9 => Opcode::GetTemporaryTopic,
            10 => Opcode::DeleteTemporaryDestination,
            11 => Opcode::AddMessage,
            12 => Opcode::Receive,
            13 => Opcode::Browse,
            14 => Opcode::Subscribe,
            15 => Opcode::Unsubscribe,
            16 => Opcode::DestroySubscription,
            17 => Opcode::Acknowledge,
            18 => Opcode::Transact,
            19 => Opcode::SetEnabled,
            20 => Opcode::Ping,
            64 => Opcode::Deliver,
            65 => Opcode::PushPing,
            other => return Err(MqwireError::BadOpcode(other)),
        })
    }
}
