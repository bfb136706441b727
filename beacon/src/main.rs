//! beacon - inspect and feed the local analytics queue
//!
//! This tool provides commands for:
//! - Showing configuration, queue and identifier status
//! - Tracking events into the durable queue
//! - Managing identifiers
//! - Clearing the pending queue
//!
//! Delivery is done by `beacon-deliver`. Commands that change the queue
//! refuse to run while it owns the queue.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/beacon/beacon.db (~/.local/share/beacon/beacon.db)
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)

use anyhow::{bail, Context, Result};
use beacon_core::{Agent, Config, IdKind};
use clap::{Parser, Subcommand};

mod process_lock;

use process_lock::QueueGuard;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Inspect and feed the local analytics queue")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, queue and identifier status
    Status {
        /// Print the pending queue as JSON
        #[arg(long)]
        pending: bool,
    },

    /// Track an event into the pending queue
    Track {
        #[command(subcommand)]
        event: TrackCommand,
    },

    /// Manage identifiers
    Id {
        #[command(subcommand)]
        command: IdCommand,
    },

    /// Drop every pending message
    Clear,
}

impl Command {
    fn changes_queue(&self) -> bool {
        matches!(
            self,
            Command::Track { .. }
                | Command::Clear
                | Command::Id {
                    command: IdCommand::Set { .. } | IdCommand::Clear { .. }
                }
        )
    }
}

#[derive(Subcommand)]
enum TrackCommand {
    /// Payment made by the user
    Revenue {
        amount: f64,
        /// ISO 4217 currency code
        currency: String,
        /// Virtual currency received
        #[arg(long)]
        virtual_amount: Option<f64>,
        #[arg(long)]
        reward: Option<String>,
    },

    /// Item purchase
    ItemPurchase {
        name: String,
        /// Virtual currency spent
        #[arg(long)]
        virtual_amount: Option<f64>,
    },

    /// Tutorial step
    Tutorial { step: String },

    /// Milestone reached
    Milestone { name: String, value: String },

    /// Marketing source
    Marketing {
        #[arg(long)]
        partner: Option<String>,
        #[arg(long)]
        campaign: Option<String>,
        #[arg(long)]
        ad: Option<String>,
        #[arg(long)]
        subid: Option<String>,
        #[arg(long)]
        subsubid: Option<String>,
    },

    /// User attribute
    UserAttribute { name: String, value: String },

    /// Country (ISO 3166-1 alpha-2)
    Country { code: String },
}

#[derive(Subcommand)]
enum IdCommand {
    /// Set an identifier
    Set {
        #[arg(value_parser = parse_kind)]
        kind: IdKind,
        value: String,
    },

    /// Clear an identifier
    Clear {
        #[arg(value_parser = parse_kind)]
        kind: IdKind,
    },

    /// List known identifiers
    List,
}

fn parse_kind(s: &str) -> std::result::Result<IdKind, String> {
    IdKind::parse(s).ok_or_else(|| {
        let kinds: Vec<&str> = IdKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown identifier kind '{}' (expected one of: {})", s, kinds.join(", "))
    })
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(beacon_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    let _queue_guard = if args.command.changes_queue() {
        match QueueGuard::try_acquire(&Config::database_path())? {
            Some(guard) => Some(guard),
            None => bail!(
                "refusing to modify the queue: another beacon process owns it (is beacon-deliver running?)"
            ),
        }
    } else {
        None
    };

    let agent = Agent::open(&config).context("failed to open agent")?;
    agent.initialize().context("failed to load agent state")?;

    match args.command {
        Command::Status { pending } => cmd_status(&config, &agent, pending),
        Command::Track { event } => cmd_track(&agent, event),
        Command::Id { command } => cmd_id(&agent, command),
        Command::Clear => cmd_clear(&agent),
    }
}

fn cmd_status(config: &Config, agent: &Agent, show_pending: bool) -> Result<()> {
    println!("Beacon Status");
    println!("=============");
    println!();

    let collector = &config.collector;
    println!(
        "Server URL:      {}",
        collector.server_url.as_deref().unwrap_or("<not set>")
    );
    println!("API Key:         {}", set_or_not(collector.api_key.is_some()));
    println!(
        "Secret Key:      {}",
        set_or_not(collector.secret_key.is_some())
    );
    match collector.validate() {
        Ok(()) => println!("Collector:       Ready"),
        Err(e) => println!("Collector:       Not ready ({})", e),
    }
    println!();

    println!("Update Interval: {}ms", agent.update_interval().as_millis());
    println!("Send Timeout:    {}ms", agent.send_timeout().as_millis());
    println!(
        "Check Interval:  {}ms",
        agent.check_server_interval().as_millis()
    );
    println!("Test Mode:       {}", agent.test_mode().as_str());
    println!("Analytics:       {}", enabled_or_not(agent.analytics_enabled()));
    println!("Payable:         {}", enabled_or_not(agent.payable()));
    println!();

    println!("Pending:         {}", agent.pending_count());
    println!();

    println!("Identifiers:");
    print_identifiers(agent);

    if show_pending {
        let json = agent
            .context()
            .pending_json()
            .context("failed to serialize pending queue")?;
        let value: serde_json::Value =
            serde_json::from_str(&json).context("failed to parse pending queue")?;
        println!();
        println!("{}", serde_json::to_string_pretty(&value)?);
    }

    Ok(())
}

fn cmd_track(agent: &Agent, event: TrackCommand) -> Result<()> {
    if !agent.analytics_enabled() {
        bail!("analytics is disabled in config.toml");
    }

    let before = agent.pending_count();
    let label = match &event {
        TrackCommand::Revenue {
            amount,
            currency,
            virtual_amount,
            reward,
        } => {
            match virtual_amount {
                Some(vc) => agent.track_revenue_with_virtual_currency(
                    *amount,
                    currency,
                    *vc,
                    reward.as_deref(),
                ),
                None => agent.track_revenue(*amount, currency, reward.as_deref()),
            }
            "revenue"
        }
        TrackCommand::ItemPurchase {
            name,
            virtual_amount,
        } => {
            match virtual_amount {
                Some(vc) => agent.track_item_purchase_with_virtual_currency(name, *vc),
                None => agent.track_item_purchase(name),
            }
            "item_purchase"
        }
        TrackCommand::Tutorial { step } => {
            agent.track_tutorial(step);
            "tutorial"
        }
        TrackCommand::Milestone { name, value } => {
            agent.track_milestone(name, value);
            "milestone"
        }
        TrackCommand::Marketing {
            partner,
            campaign,
            ad,
            subid,
            subsubid,
        } => {
            agent.track_marketing(
                partner.as_deref(),
                campaign.as_deref(),
                ad.as_deref(),
                subid.as_deref(),
                subsubid.as_deref(),
            );
            "marketing"
        }
        TrackCommand::UserAttribute { name, value } => {
            agent.track_user_attribute(name, value);
            "user_attribute"
        }
        TrackCommand::Country { code } => {
            agent.track_country(code);
            "country"
        }
    };

    if agent.pending_count() == before {
        bail!("invalid arguments for {} event; nothing queued", label);
    }

    agent.persist().context("failed to save pending queue")?;
    println!("Queued {} event ({} pending)", label, agent.pending_count());
    Ok(())
}

fn cmd_id(agent: &Agent, command: IdCommand) -> Result<()> {
    match command {
        IdCommand::Set { kind, value } => {
            agent
                .set_id(kind, &value)
                .with_context(|| format!("failed to set {} identifier", kind))?;
            agent.persist().context("failed to save pending queue")?;
            println!("{} = {}", kind, agent.id(kind));
        }
        IdCommand::Clear { kind } => {
            agent
                .clear_id(kind)
                .with_context(|| format!("failed to clear {} identifier", kind))?;
            agent.persist().context("failed to save pending queue")?;
            println!("{} cleared", kind);
        }
        IdCommand::List => print_identifiers(agent),
    }
    Ok(())
}

fn cmd_clear(agent: &Agent) -> Result<()> {
    let dropped = agent.pending_count();
    agent
        .clear_pending()
        .context("failed to clear pending queue")?;
    println!("Dropped {} pending messages", dropped);
    Ok(())
}

fn print_identifiers(agent: &Agent) {
    let ids = agent.identifiers();
    if ids.is_empty() {
        println!("  (none)");
        return;
    }
    for (kind, value) in ids.iter() {
        println!("  {:<12} {}", kind.as_str(), value);
    }
}

fn set_or_not(set: bool) -> &'static str {
    if set {
        "<set>"
    } else {
        "<not set>"
    }
}

fn enabled_or_not(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
