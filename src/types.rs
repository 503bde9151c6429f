//! # Identifier and Protocol Types
//!
//! All identities in the federation are opaque 64-bit integers distinguished
//! at the type level: a `ZoneId` can never be confused with an `ObjectId`,
//! and the three zone roles a call carries (destination, caller, known
//! direction) each get their own type. The zero value always means
//! "absent/null".
//!
//! `InterfaceDescriptor` is the on-wire handle: the `(object,
//! destination_zone)` pair that lets any zone in the chain route a reference
//! back to the stub that owns it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// The null identity.
            pub const NULL: Self = Self(0);

            pub fn value(self) -> u64 {
                self.0
            }

            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identity of a local registry (service). Unique in the federation for
    /// the lifetime of the connection.
    ZoneId
);
id_type!(
    /// The zone a call is ultimately for.
    DestinationZoneId
);
id_type!(
    /// The zone that originated a call, as observed at the current hop.
    CallerZoneId
);
id_type!(
    /// The next hop along the return path; null means unknown.
    KnownDirectionZoneId
);
id_type!(
    /// Identity of a stub within its owning zone.
    ObjectId
);
id_type!(
    /// Ordinal of an interface contract at a given protocol version.
    InterfaceOrdinal
);
id_type!(
    /// Ordinal of a method within an interface.
    MethodId
);

impl ZoneId {
    pub fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    pub fn as_caller(self) -> CallerZoneId {
        CallerZoneId(self.0)
    }

    pub fn as_known_direction(self) -> KnownDirectionZoneId {
        KnownDirectionZoneId(self.0)
    }
}

impl DestinationZoneId {
    pub fn as_zone(self) -> ZoneId {
        ZoneId(self.0)
    }

    pub fn as_caller(self) -> CallerZoneId {
        CallerZoneId(self.0)
    }
}

impl CallerZoneId {
    pub fn as_zone(self) -> ZoneId {
        ZoneId(self.0)
    }

    pub fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    pub fn as_known_direction(self) -> KnownDirectionZoneId {
        KnownDirectionZoneId(self.0)
    }
}

/// The on-wire reference handle: which object, in which zone. All zeros is
/// the null reference.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub object: ObjectId,
    pub destination_zone: DestinationZoneId,
}

impl InterfaceDescriptor {
    pub const NULL: Self = Self {
        object: ObjectId::NULL,
        destination_zone: DestinationZoneId::NULL,
    };

    pub fn new(object: ObjectId, destination_zone: DestinationZoneId) -> Self {
        Self {
            object,
            destination_zone,
        }
    }

    pub fn is_null(self) -> bool {
        self.object.is_null() && self.destination_zone.is_null()
    }
}

impl fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.object, self.destination_zone)
    }
}

/// Payload encodings a service proxy may stamp onto a call. The envelope
/// itself is always binary; this selects how method arguments are encoded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    Binary,
    CompressedBinary,
    Json,
    /// Declared for wire compatibility; this build carries no protobuf codec
    /// and rejects it at encode time.
    ProtocolBuffers,
}

/// Bitfield controlling how an `add_ref` walks the transport chain.
///
/// `BUILD_CALLER_ROUTE` and `BUILD_DESTINATION_ROUTE` each traverse only
/// their own chain; intermediate hops mask them independently before
/// forwarding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddRefOptions(pub u64);

impl AddRefOptions {
    pub const NORMAL: Self = Self(0);
    pub const OPTIMISTIC: Self = Self(1);
    pub const BUILD_CALLER_ROUTE: Self = Self(2);
    pub const BUILD_DESTINATION_ROUTE: Self = Self(4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_optimistic(self) -> bool {
        self.contains(Self::OPTIMISTIC)
    }
}

impl BitOr for AddRefOptions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for AddRefOptions {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Bitfield qualifying a `release`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseOptions(pub u64);

impl ReleaseOptions {
    pub const NORMAL: Self = Self(0);
    pub const OPTIMISTIC: Self = Self(1);

    pub fn is_optimistic(self) -> bool {
        self.0 & Self::OPTIMISTIC.0 != 0
    }
}

/// Life of a transport edge. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportStatus {
    Connecting = 0,
    Connected = 1,
    Reconnecting = 2,
    Disconnected = 3,
}

impl TransportStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportStatus::Connecting,
            1 => TransportStatus::Connected,
            2 => TransportStatus::Reconnecting,
            _ => TransportStatus::Disconnected,
        }
    }
}

/// Life of a pass-through router. `Disconnected` is terminal; cleanup waits
/// for the in-flight call count to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PassThroughStatus {
    Connected = 0,
    Disconnected = 1,
}

impl PassThroughStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => PassThroughStatus::Connected,
            _ => PassThroughStatus::Disconnected,
        }
    }
}

/// Direction bit in the envelope prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageDirection {
    Send = 1,
    Reply = 2,
}

impl MessageDirection {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageDirection::Send),
            2 => Some(MessageDirection::Reply),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_descriptor() {
        assert!(InterfaceDescriptor::NULL.is_null());
        assert!(!InterfaceDescriptor::new(ObjectId(1), DestinationZoneId(2)).is_null());
        // A descriptor with only one half set is not the null reference.
        assert!(!InterfaceDescriptor::new(ObjectId(1), DestinationZoneId(0)).is_null());
    }

    #[test]
    fn zone_role_conversions() {
        let zone = ZoneId(7);
        assert_eq!(zone.as_destination().as_zone(), zone);
        assert_eq!(zone.as_caller().as_zone(), zone);
        assert_eq!(zone.as_caller().as_destination(), zone.as_destination());
    }

    #[test]
    fn add_ref_option_masking() {
        let both = AddRefOptions::BUILD_CALLER_ROUTE | AddRefOptions::BUILD_DESTINATION_ROUTE;
        assert!(both.contains(AddRefOptions::BUILD_CALLER_ROUTE));
        assert!(both.contains(AddRefOptions::BUILD_DESTINATION_ROUTE));
        assert!(!both.is_optimistic());

        let masked = both.without(AddRefOptions::BUILD_CALLER_ROUTE);
        assert!(!masked.contains(AddRefOptions::BUILD_CALLER_ROUTE));
        assert!(masked.contains(AddRefOptions::BUILD_DESTINATION_ROUTE));
    }

    #[test]
    fn normal_options_contain_nothing() {
        assert!(!AddRefOptions::NORMAL.contains(AddRefOptions::OPTIMISTIC));
        assert!(!ReleaseOptions::NORMAL.is_optimistic());
        assert!(ReleaseOptions::OPTIMISTIC.is_optimistic());
    }
}
