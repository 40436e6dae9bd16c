use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! named_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

numeric_id!(
    /// Identifier of an independent game world.
    PlanetId(u32)
);
numeric_id!(TycoonId(u64));
numeric_id!(CorporationId(u64));
numeric_id!(CompanyId(u64));
numeric_id!(BuildingId(u64));
numeric_id!(TownId(u64));
numeric_id!(ConnectionId(u64));
numeric_id!(
    /// Front-end socket identifier, assigned by the worker that owns the socket.
    SocketId(u64)
);

named_id!(
    /// Catalog key of a building type.
    DefinitionId
);
named_id!(
    /// Catalog key of a resource (goods, labor, or service).
    ResourceId
);
named_id!(InventionId);

impl CorporationId {
    /// Platform-owned infrastructure. Spend by buildings of this corporation is
    /// charged to the building's town instead of a corporation P&L.
    pub const PLATFORM: CorporationId = CorporationId(0);

    pub fn is_platform(self) -> bool {
        self == Self::PLATFORM
    }
}
