// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security group and rule types, and rule validation.

use super::Error;
use super::Name;
use crate::typed_uuid::AccountUuid;
use crate::typed_uuid::SecurityGroupUuid;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// ICMP type or code meaning "any".
pub const ICMP_ANY: i32 = -1;

/// Largest valid ICMP type or code.
pub const ICMP_MAX: i32 = 255;

/// Largest valid TCP or UDP port.
pub const PORT_MAX: i32 = 65535;

/// Create-time parameters for a security group
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SecurityGroupCreate {
    pub name: Name,
    pub description: String,
}

/// Which traffic a rule allows
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

impl fmt::Display for RuleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleDirection::Ingress => "ingress",
            RuleDirection::Egress => "egress",
        })
    }
}

/// The protocol a rule applies to
///
/// Numeric protocols that have a named variant are normalized to it when
/// parsed, so "6" and "tcp" produce the same rule.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Icmp,
    Number(u8),
    All,
}

impl RuleProtocol {
    /// Returns whether rules for this protocol carry a port range.
    pub fn has_ports(&self) -> bool {
        matches!(self, RuleProtocol::Tcp | RuleProtocol::Udp)
    }
}

impl FromStr for RuleProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(RuleProtocol::Tcp),
            "udp" => Ok(RuleProtocol::Udp),
            "icmp" => Ok(RuleProtocol::Icmp),
            "all" => Ok(RuleProtocol::All),
            other => match other.parse::<u8>() {
                Ok(1) => Ok(RuleProtocol::Icmp),
                Ok(6) => Ok(RuleProtocol::Tcp),
                Ok(17) => Ok(RuleProtocol::Udp),
                Ok(n) => Ok(RuleProtocol::Number(n)),
                Err(_) => Err(format!(
                    "unsupported protocol \"{}\" (expected tcp, udp, icmp, \
                     all, or a protocol number 0-255)",
                    s
                )),
            },
        }
    }
}

impl TryFrom<String> for RuleProtocol {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RuleProtocol> for String {
    fn from(protocol: RuleProtocol) -> String {
        protocol.to_string()
    }
}

impl fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleProtocol::Tcp => f.write_str("tcp"),
            RuleProtocol::Udp => f.write_str("udp"),
            RuleProtocol::Icmp => f.write_str("icmp"),
            RuleProtocol::All => f.write_str("all"),
            RuleProtocol::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Where traffic allowed by a rule may come from (ingress) or go to (egress)
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuleSource {
    /// A literal network
    Cidr(IpNetwork),
    /// Every running member of another security group
    Group(SecurityGroupUuid),
}

/// The source of a rule as supplied by a caller, before group references are
/// resolved to ids
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleSourceParams {
    Cidr { cidr: IpNetwork },
    Group { account: AccountUuid, name: Name },
}

/// Create-time parameters for a security group rule
///
/// Port fields apply to tcp and udp; ICMP fields apply to icmp.  Neither may
/// be given for "all" or numeric protocols.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SecurityGroupRuleCreate {
    pub direction: RuleDirection,
    pub protocol: RuleProtocol,
    #[serde(default)]
    pub start_port: Option<i32>,
    #[serde(default)]
    pub end_port: Option<i32>,
    #[serde(default)]
    pub icmp_type: Option<i32>,
    #[serde(default)]
    pub icmp_code: Option<i32>,
    pub source: RuleSourceParams,
}

impl SecurityGroupRuleCreate {
    /// Validates the protocol-specific fields and returns the normalized
    /// `(start_port_or_icmp_type, end_port_or_icmp_code)` pair stored with
    /// the rule.
    pub fn normalized_ports(&self) -> Result<(i32, i32), Error> {
        match self.protocol {
            RuleProtocol::Tcp | RuleProtocol::Udp => {
                if self.icmp_type.is_some() || self.icmp_code.is_some() {
                    return Err(Error::invalid_value(
                        "icmp_type",
                        "ICMP type and code apply only to the icmp protocol",
                    ));
                }
                let start = self.start_port.ok_or_else(|| {
                    Error::invalid_value(
                        "start_port",
                        &format!("a port is required for {}", self.protocol),
                    )
                })?;
                let end = self.end_port.unwrap_or(start);
                for (label, port) in [("start_port", start), ("end_port", end)]
                {
                    if !(0..=PORT_MAX).contains(&port) {
                        return Err(Error::invalid_value(
                            label,
                            &format!("port {} is outside 0-{}", port, PORT_MAX),
                        ));
                    }
                }
                if start > end {
                    return Err(Error::invalid_value(
                        "end_port",
                        &format!(
                            "end port {} is less than start port {}",
                            end, start
                        ),
                    ));
                }
                Ok((start, end))
            }

            RuleProtocol::Icmp => {
                if self.start_port.is_some() || self.end_port.is_some() {
                    return Err(Error::invalid_value(
                        "start_port",
                        "ports do not apply to the icmp protocol",
                    ));
                }
                let icmp_type = self.icmp_type.unwrap_or(ICMP_ANY);
                let icmp_code = self.icmp_code.unwrap_or(ICMP_ANY);
                for (label, value) in
                    [("icmp_type", icmp_type), ("icmp_code", icmp_code)]
                {
                    if !(ICMP_ANY..=ICMP_MAX).contains(&value) {
                        return Err(Error::invalid_value(
                            label,
                            &format!(
                                "{} is outside {}-{}",
                                value, ICMP_ANY, ICMP_MAX
                            ),
                        ));
                    }
                }
                if icmp_type == ICMP_ANY && icmp_code != ICMP_ANY {
                    return Err(Error::invalid_value(
                        "icmp_code",
                        "ICMP code must be -1 when ICMP type is -1",
                    ));
                }
                if icmp_code == ICMP_ANY && icmp_type != ICMP_ANY {
                    return Err(Error::invalid_value(
                        "icmp_code",
                        "ICMP code -1 is only valid with ICMP type -1",
                    ));
                }
                Ok((icmp_type, icmp_code))
            }

            RuleProtocol::All | RuleProtocol::Number(_) => {
                let given = [
                    self.start_port,
                    self.end_port,
                    self.icmp_type,
                    self.icmp_code,
                ];
                if given.iter().flatten().any(|v| *v != 0) {
                    return Err(Error::invalid_value(
                        "protocol",
                        &format!(
                            "ports and ICMP parameters are not allowed for \
                             protocol {}",
                            self.protocol
                        ),
                    ));
                }
                Ok((0, 0))
            }
        }
    }
}

/// Checks that a literal CIDR names a network rather than a host inside one
/// (e.g., "10.0.0.0/8" rather than "10.1.2.3/8").
pub fn validate_cidr(cidr: IpNetwork) -> Result<IpNetwork, Error> {
    if cidr.network() != cidr.ip() {
        return Err(Error::invalid_value(
            "cidr",
            &format!(
                "{} has host bits set (did you mean {}/{}?)",
                cidr,
                cidr.network(),
                cidr.prefix()
            ),
        ));
    }
    Ok(cidr)
}

#[cfg(test)]
mod test {
    use super::*;

    fn rule(
        protocol: &str,
        ports: (Option<i32>, Option<i32>),
        icmp: (Option<i32>, Option<i32>),
    ) -> SecurityGroupRuleCreate {
        SecurityGroupRuleCreate {
            direction: RuleDirection::Ingress,
            protocol: protocol.parse().unwrap(),
            start_port: ports.0,
            end_port: ports.1,
            icmp_type: icmp.0,
            icmp_code: icmp.1,
            source: RuleSourceParams::Cidr { cidr: "0.0.0.0/0".parse().unwrap() },
        }
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP".parse::<RuleProtocol>().unwrap(), RuleProtocol::Tcp);
        assert_eq!("17".parse::<RuleProtocol>().unwrap(), RuleProtocol::Udp);
        assert_eq!("1".parse::<RuleProtocol>().unwrap(), RuleProtocol::Icmp);
        assert_eq!(
            "47".parse::<RuleProtocol>().unwrap(),
            RuleProtocol::Number(47)
        );
        assert!("256".parse::<RuleProtocol>().is_err());
        assert!("sctp".parse::<RuleProtocol>().is_err());
        assert_eq!(RuleProtocol::Number(47).to_string(), "47");
    }

    #[test]
    fn test_tcp_udp_ports() {
        assert_eq!(
            rule("tcp", (Some(22), None), (None, None))
                .normalized_ports()
                .unwrap(),
            (22, 22)
        );
        assert_eq!(
            rule("udp", (Some(0), Some(65535)), (None, None))
                .normalized_ports()
                .unwrap(),
            (0, 65535)
        );

        let bad = [
            rule("tcp", (None, None), (None, None)),
            rule("tcp", (Some(-1), Some(10)), (None, None)),
            rule("tcp", (Some(10), Some(65536)), (None, None)),
            rule("udp", (Some(100), Some(99)), (None, None)),
            rule("tcp", (Some(22), None), (Some(8), Some(0))),
        ];
        for r in bad {
            assert!(
                matches!(r.normalized_ports(), Err(Error::InvalidValue { .. })),
                "expected {:?} to be rejected",
                r
            );
        }
    }

    #[test]
    fn test_icmp_sentinels() {
        assert_eq!(
            rule("icmp", (None, None), (None, None))
                .normalized_ports()
                .unwrap(),
            (ICMP_ANY, ICMP_ANY)
        );
        assert_eq!(
            rule("icmp", (None, None), (Some(8), Some(0)))
                .normalized_ports()
                .unwrap(),
            (8, 0)
        );

        // type = -1 requires code = -1
        assert!(rule("icmp", (None, None), (Some(-1), Some(0)))
            .normalized_ports()
            .is_err());
        // code = -1 requires type = -1
        assert!(rule("icmp", (None, None), (Some(8), Some(-1)))
            .normalized_ports()
            .is_err());
        assert!(rule("icmp", (None, None), (Some(8), None))
            .normalized_ports()
            .is_err());
        assert!(rule("icmp", (None, None), (Some(256), Some(0)))
            .normalized_ports()
            .is_err());
        assert!(rule("icmp", (None, None), (Some(-2), Some(-1)))
            .normalized_ports()
            .is_err());
        assert!(rule("icmp", (Some(1), None), (None, None))
            .normalized_ports()
            .is_err());
    }

    #[test]
    fn test_all_protocol_normalizes_to_zero() {
        assert_eq!(
            rule("all", (None, None), (None, None))
                .normalized_ports()
                .unwrap(),
            (0, 0)
        );
        assert_eq!(
            rule("all", (Some(0), Some(0)), (None, None))
                .normalized_ports()
                .unwrap(),
            (0, 0)
        );
        assert_eq!(
            rule("47", (None, None), (None, None))
                .normalized_ports()
                .unwrap(),
            (0, 0)
        );
        assert!(rule("all", (Some(22), Some(22)), (None, None))
            .normalized_ports()
            .is_err());
    }

    #[test]
    fn test_validate_cidr() {
        assert!(validate_cidr("10.0.0.0/8".parse().unwrap()).is_ok());
        assert!(validate_cidr("10.0.0.5/32".parse().unwrap()).is_ok());
        assert!(validate_cidr("fd00::/64".parse().unwrap()).is_ok());
        assert!(validate_cidr("10.1.2.3/8".parse().unwrap()).is_err());
    }
}
