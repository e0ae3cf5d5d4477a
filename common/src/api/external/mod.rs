// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing security groups,
//! rules and instances at the control plane's authorization boundary
//!
//! The code here is used by both the control plane and the host agents, so
//! it should not depend on either of those crates.

mod error;
mod security_group;

pub use error::*;
pub use security_group::*;

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FormatResult;
use std::str::FromStr;

//
// The type aliases below exist primarily to ensure consistency among return
// types for functions in the control plane and datastore.
//

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

/// A name used in the API
///
/// Names are generally user-provided unique identifiers, highly constrained:
/// they begin with a lowercase ASCII letter, contain only lowercase ASCII
/// letters, digits and "-", do not end with "-", and are at most 63
/// characters long.  A `Name` can only be constructed with a string that's
/// valid as a name.
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(try_from = "String")]
pub struct Name(String);

/// `Name::try_from(String)` is the primary method for constructing a Name
/// from an input string.  This validates the string according to our
/// requirements for a name.
impl TryFrom<String> for Name {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() > 63 {
            return Err(String::from("name may contain at most 63 characters"));
        }

        let mut iter = value.chars();

        let first = iter.next().ok_or_else(|| {
            String::from("name requires at least one character")
        })?;
        if !first.is_ascii_lowercase() {
            return Err(String::from(
                "name must begin with an ASCII lowercase character",
            ));
        }

        let mut last = first;
        for c in iter {
            last = c;

            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
                return Err(format!(
                    "name contains invalid character: \"{}\" (allowed \
                     characters are lowercase ASCII, digits, and \"-\")",
                    c
                ));
            }
        }

        if last == '-' {
            return Err(String::from("name cannot end with \"-\""));
        }

        Ok(Name(value))
    }
}

impl FromStr for Name {
    type Err = String;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Name::try_from(String::from(value))
    }
}

impl From<Name> for String {
    fn from(name: Name) -> String {
        name.0
    }
}

impl Name {
    /// Parse an `Name`.  This is a convenience wrapper around
    /// `Name::try_from(String)` that marshals any error into an appropriate
    /// `Error`.
    pub fn from_param(value: String, label: &str) -> Result<Name, Error> {
        value.parse().map_err(|e: String| Error::invalid_value(label, &e))
    }

    /// Return the `&str` representing the actual name.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        self.0.fmt(f)
    }
}

/// Identifies a type of API resource
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ResourceType {
    Account,
    BackgroundTask,
    Host,
    Instance,
    SecurityGroup,
    SecurityGroupRule,
    WorkItem,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                ResourceType::Account => "account",
                ResourceType::BackgroundTask => "background task",
                ResourceType::Host => "host",
                ResourceType::Instance => "instance",
                ResourceType::SecurityGroup => "security group",
                ResourceType::SecurityGroupRule => "security group rule",
                ResourceType::WorkItem => "work item",
            }
        )
    }
}
