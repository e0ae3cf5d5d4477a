// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// A UUID with type-level information about what it's used for.
///
/// Instances, security groups, rules, hosts and accounts are all identified by
/// UUIDs.  If they're all the same type, it's easy to hand a group id to
/// something expecting an instance id.  This module provides a level of type
/// safety which should hopefully prevent most mistakes.
///
/// This uses a marker type rather than defining separate `InstanceId`,
/// `GroupId` etc, to make it easier to write code that's generic over all
/// possible typed UUIDs.
#[derive_where(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct TypedUuid<T: TypedUuidKind> {
    uuid: Uuid,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: TypedUuidKind> TypedUuid<T> {
    /// Creates a new UUID of this type.
    #[inline]
    pub fn new_v4() -> Self {
        Self { uuid: Uuid::new_v4(), _phantom: std::marker::PhantomData }
    }

    /// Create a new `TypedUuid` from an untyped [`Uuid`].
    ///
    /// It is the caller's responsibility to ensure that the UUID is of the
    /// correct type.
    #[inline]
    pub fn from_untyped_uuid(uuid: Uuid) -> Self {
        Self { uuid, _phantom: std::marker::PhantomData }
    }

    /// Returns the inner [`Uuid`].
    #[inline]
    pub fn into_untyped_uuid(self) -> Uuid {
        self.uuid
    }

    #[inline]
    pub fn as_untyped_uuid(&self) -> &Uuid {
        &self.uuid
    }
}

impl<T: TypedUuidKind> fmt::Debug for TypedUuid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)?;
        write!(f, " ({})", T::tag())
    }
}

impl<T: TypedUuidKind> fmt::Display for TypedUuid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)
    }
}

impl<T: TypedUuidKind> FromStr for TypedUuid<T> {
    type Err = TypedUuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|error| TypedUuidParseError { error, tag: T::tag() })?;
        Ok(Self { uuid, _phantom: std::marker::PhantomData })
    }
}

/// Represents marker types that can be used as a type parameter for
/// [`TypedUuid`].
pub trait TypedUuidKind: Send + Sync + 'static {
    /// Returns the corresponding tag for this kind.
    ///
    /// The tag forms a runtime representation of this type-level value.
    fn tag() -> TypedUuidTag;
}

/// Describes what kind of [`TypedUuid`] something is.
///
/// This is the runtime equivalent of [`TypedUuidKind`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypedUuidTag {
    Account,
    Host,
    Instance,
    SecurityGroup,
    SecurityGroupRule,
}

impl TypedUuidTag {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TypedUuidTag::Account => "account",
            TypedUuidTag::Host => "host",
            TypedUuidTag::Instance => "instance",
            TypedUuidTag::SecurityGroup => "security_group",
            TypedUuidTag::SecurityGroupRule => "security_group_rule",
        }
    }
}

impl fmt::Display for TypedUuidTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error that occurred while parsing a [`TypedUuid`].
#[derive(Clone, Debug, Error)]
#[error("error parsing UUID ({tag})")]
pub struct TypedUuidParseError {
    #[source]
    pub error: uuid::Error,
    pub tag: TypedUuidTag,
}

macro_rules! impl_typed_uuid_kind {
    ($($kind:ident => $tag:ident as $alias:ident),* $(,)?) => {
        $(
            #[derive(Debug)]
            pub enum $kind {}

            impl TypedUuidKind for $kind {
                #[inline]
                fn tag() -> TypedUuidTag {
                    TypedUuidTag::$tag
                }
            }

            pub type $alias = TypedUuid<$kind>;
        )*
    };
}

impl_typed_uuid_kind! {
    AccountKind => Account as AccountUuid,
    HostKind => Host as HostUuid,
    InstanceKind => Instance as InstanceUuid,
    SecurityGroupKind => SecurityGroup as SecurityGroupUuid,
    SecurityGroupRuleKind => SecurityGroupRule as SecurityGroupRuleUuid,
}
