// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the security group control plane against
//! simulated host agents

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use secgroup_common::api::external::Error;
use secgroup_common::api::external::Name;
use secgroup_common::api::external::RuleDirection;
use secgroup_common::api::external::RuleProtocol;
use secgroup_common::api::external::RuleSourceParams;
use secgroup_common::api::external::SecurityGroupCreate;
use secgroup_common::api::external::SecurityGroupRuleCreate;
use secgroup_common::typed_uuid::AccountUuid;
use secgroup_common::typed_uuid::HostUuid;
use secgroup_nexus::app::agent_channel::LocalAgentChannel;
use secgroup_nexus::app::instance::InstanceCreate;
use secgroup_nexus::context::OpContext;
use secgroup_nexus::db::model::NetworkInterface;
use secgroup_nexus::Config;
use secgroup_nexus::Nexus;
use secgroup_sled_agent::sim::SimFirewallAgent;
use slog::Logger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How often simulated agents are asked to report what they enforce
const RESYNC_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[clap(
    name = "secgroup-nexus",
    about = "Security group ruleset propagation with simulated agents"
)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control plane until interrupted
    Run {
        /// Path to the TOML configuration file
        #[clap(long, action)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Run { config } => run(config).await,
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let log = config
        .log
        .to_logger("secgroup-nexus")
        .context("initializing logger")?;

    let channel = Arc::new(LocalAgentChannel::new(
        &log,
        config.propagation.answer_timeout,
    ));
    let nexus =
        Nexus::new_with_id(Uuid::new_v4(), log.clone(), &config, channel.clone());
    channel.register_listener(nexus.answer_handler());

    let mut hosts = Vec::with_capacity(config.sim.host_count);
    for _ in 0..config.sim.host_count {
        let host_id = HostUuid::new_v4();
        let agent = Arc::new(SimFirewallAgent::new(&log, host_id));
        channel.connect(host_id, agent).await;
        hosts.push(host_id);
    }

    populate(&nexus, &log, &hosts)
        .await
        .context("populating simulated deployment")?;

    let mut resync = tokio::time::interval(RESYNC_PERIOD);
    resync.tick().await;
    loop {
        tokio::select! {
            _ = resync.tick() => {
                for host_id in channel.connected_hosts() {
                    if let Err(error) = channel.request_report(host_id).await {
                        slog::warn!(log, "resync request failed";
                            "error" => %error);
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                break;
            }
        }
    }

    slog::info!(log, "shutting down";
        "queue_depth" => nexus
            .queue_depth(&OpContext::for_background(log.clone()))
            .await
            .unwrap_or_default(),
        "discarded" => nexus.discard_count());
    for host_id in hosts {
        channel.disconnect(host_id).await;
    }
    Ok(())
}

/// Creates one account with a web tier reachable over ssh from a bastion
/// tier, and starts its instances spread over the simulated hosts
async fn populate(
    nexus: &Nexus,
    log: &Logger,
    hosts: &[HostUuid],
) -> Result<(), Error> {
    let opctx = OpContext::for_request(log.clone(), "populate");
    let account_id = AccountUuid::new_v4();

    let bastion = nexus
        .security_group_create(
            &opctx,
            account_id,
            SecurityGroupCreate {
                name: name("bastion")?,
                description: String::from("ssh jump hosts"),
            },
        )
        .await?;
    let web = nexus
        .security_group_create(
            &opctx,
            account_id,
            SecurityGroupCreate {
                name: name("web")?,
                description: String::from("web servers"),
            },
        )
        .await?;
    nexus
        .security_group_rule_authorize(
            &opctx,
            web.id,
            SecurityGroupRuleCreate {
                direction: RuleDirection::Ingress,
                protocol: RuleProtocol::Tcp,
                start_port: Some(22),
                end_port: None,
                icmp_type: None,
                icmp_code: None,
                source: RuleSourceParams::Group {
                    account: account_id,
                    name: bastion.name.clone(),
                },
            },
        )
        .await?;
    nexus
        .security_group_rule_authorize(
            &opctx,
            web.id,
            SecurityGroupRuleCreate {
                direction: RuleDirection::Ingress,
                protocol: RuleProtocol::Tcp,
                start_port: Some(443),
                end_port: None,
                icmp_type: None,
                icmp_code: None,
                source: RuleSourceParams::Cidr {
                    cidr: "0.0.0.0/0".parse().map_err(
                        |e: ipnetwork::IpNetworkError| {
                            Error::internal_error(&e.to_string())
                        },
                    )?,
                },
            },
        )
        .await?;

    if hosts.is_empty() {
        return Ok(());
    }
    let tiers = [(&bastion, 1u8), (&web, 2u8)];
    for (i, (group, count)) in tiers.into_iter().enumerate() {
        for n in 0..count {
            let octet = 10 * (i as u8 + 1) + n;
            let instance = nexus
                .instance_create(
                    &opctx,
                    account_id,
                    InstanceCreate {
                        name: name(&format!("{}-{}", group.name, n))?,
                        nic: NetworkInterface {
                            ipv4: [10, 0, 0, octet].into(),
                            ipv6: None,
                            mac: [2, 8, 32, 0, 0, octet].into(),
                            secondary_ips: vec![],
                        },
                        security_groups: vec![group.name.clone()],
                    },
                )
                .await?;
            let host_id = hosts[usize::from(octet) % hosts.len()];
            nexus.instance_start(&opctx, instance.id, host_id).await?;
        }
    }
    Ok(())
}

fn name(value: &str) -> Result<Name, Error> {
    Name::from_param(value.to_string(), "name")
}
