//! Densely numbered entity references as an alternative to pointers.
//!
//! Compiler data structures in this workspace reference each other through
//! small typed indices instead of Rust references: a `u32` wrapped in a
//! newtype per entity kind. The owning arena is a `PrimaryMap` and secondary
//! information hangs off `SecondaryMap`s, so cyclic structures (a node and
//! its users) need no reference counting and stay compact in memory.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]

pub mod packed_option;

mod keys;
mod map;
mod primary;
mod set;

pub use crate::keys::Keys;
pub use crate::map::SecondaryMap;
pub use crate::primary::PrimaryMap;
pub use crate::set::EntitySet;

/// A type wrapping a small integer index should implement `EntityRef` so it
/// can be used as the key of a `PrimaryMap` or `SecondaryMap`.
pub trait EntityRef: Copy + Eq {
    /// Create a new entity reference from a small integer.
    /// This should crash if the requested index is not representable.
    fn new(_: usize) -> Self;

    /// Get the index that was used to create this entity reference.
    fn index(self) -> usize;
}

/// Macro which provides the common implementation of a 32-bit entity
/// reference: `EntityRef`, `ReservedValue`, and optionally a `Display`
/// implementation using the given prefix.
#[macro_export]
macro_rules! entity_impl {
    // Basic traits.
    ($entity:ident) => {
        impl $crate::EntityRef for $entity {
            fn new(index: usize) -> Self {
                debug_assert!(index < (::core::u32::MAX as usize));
                $entity(index as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl $crate::packed_option::ReservedValue for $entity {
            fn reserved_value() -> $entity {
                $entity(::core::u32::MAX)
            }
        }

        impl $entity {
            /// Create a new instance from a `u32`.
            #[allow(dead_code)]
            pub fn from_u32(x: u32) -> Self {
                debug_assert!(x < ::core::u32::MAX);
                $entity(x)
            }

            /// Return the underlying index value as a `u32`.
            #[allow(dead_code)]
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }
    };

    // Include basic `Display` impl using the given display prefix.
    // Display a `Node` reference as "node12".
    ($entity:ident, $display_prefix:expr) => {
        entity_impl!($entity);

        impl ::core::fmt::Display for $entity {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                write!(f, concat!($display_prefix, "{}"), self.0)
            }
        }

        impl ::core::fmt::Debug for $entity {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                (self as &dyn ::core::fmt::Display).fmt(f)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, PartialEq, Eq, Hash)]
    struct E(u32);
    entity_impl!(E, "e");

    #[test]
    fn entity_refs() {
        let e4 = E::new(4);
        assert_eq!(e4.index(), 4);
        assert_eq!(e4.to_string(), "e4");
        assert_eq!(E::from_u32(4), e4);
    }
}
