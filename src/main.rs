use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::fs;
use std::path::PathBuf;

// Use library instead of local modules
use card_dispenser::{
    admin, claim_service, logging, open_database, ClaimOutcome, NewRecipient, Settings,
};

#[derive(Parser)]
#[command(name = "card-dispenser", version, about = "Redemption card dispenser")]
struct Cli {
    /// Path to a TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and its tables
    Init,
    /// Import recipients from a CSV file (identity,nickname,secret,target)
    ImportRecipients { csv: PathBuf },
    /// Add or update a single recipient
    AddRecipient {
        identity: String,
        nickname: String,
        secret: String,
        target: i64,
    },
    /// Add card codes from a file, one per line
    AddCards {
        #[arg(short, long)]
        denomination: u32,
        file: PathBuf,
    },
    /// Show unused stock per denomination and claim totals
    Stock,
    /// Claim cards for a recipient
    Claim { identity: String, secret: String },
    /// Administrative override: let a recipient claim again
    ResetClaim { identity: String },
    /// Administrative override: return a used card to inventory
    ReleaseCard { code: String },
    /// Verify the configured denominations decompose optimally
    CheckDenominations,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        logging::init_json_logger(cli.verbose);
    } else {
        logging::init_logger(cli.verbose);
    }

    let settings = Settings::load(cli.config.as_deref())?;

    // Settings::load has already validated the denominations
    if let Command::CheckDenominations = cli.command {
        println!(
            "✓ Denominations {:?} decompose optimally",
            settings.allocation.denominations.values()
        );
        return Ok(());
    }

    let mut conn = open_database(&settings.database.path, settings.database.busy_timeout())?;
    run(cli.command, &settings, &mut conn)
}

fn run(command: Command, settings: &Settings, conn: &mut Connection) -> Result<()> {
    let denominations = &settings.allocation.denominations;
    let verifier = settings.credentials.scheme.verifier();

    match command {
        Command::Init => {
            println!("✓ Database initialized at {}", settings.database.path.display());
        }
        Command::ImportRecipients { csv } => {
            println!("📂 Importing recipients from {}...", csv.display());
            let summary = admin::import_recipients_csv(conn, verifier.as_ref(), &csv)?;
            println!("✓ Created: {} recipients", summary.created);
            println!("✓ Updated: {} recipients", summary.updated);
        }
        Command::AddRecipient {
            identity,
            nickname,
            secret,
            target,
        } => {
            let recipient = NewRecipient {
                identity,
                nickname,
                secret,
                target,
            };
            let created = admin::upsert_recipient(conn, verifier.as_ref(), &recipient)?;
            let verb = if created { "Created" } else { "Updated" };
            println!("✓ {} recipient {}", verb, recipient.identity);
        }
        Command::AddCards { denomination, file } => {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let inserted = admin::add_cards(conn, denominations, &content, denomination)?;
            println!("✓ Added {} cards of denomination {}", inserted, denomination);
        }
        Command::Stock => {
            let stats = admin::stats(conn, denominations)?;
            println!("📊 Stock");
            println!("━━━━━━━━━━━━━━━━━━━━");
            for level in &stats.stock {
                println!("  {:>5}: {} unused", level.denomination, level.available);
            }
            println!(
                "\n👥 Recipients: {} ({} claimed)",
                stats.recipients_total, stats.recipients_claimed
            );
        }
        Command::Claim { identity, secret } => {
            let service = claim_service(settings);
            let outcome = service.claim(conn, &identity, &secret);
            print_outcome(&outcome);
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Command::ResetClaim { identity } => {
            if admin::reset_claim(conn, &identity)? {
                println!("✓ Claim reset for {}", identity);
            } else {
                println!("⚠️  {} is unknown or has not claimed", identity);
            }
        }
        Command::ReleaseCard { code } => {
            if admin::release_card(conn, &code)? {
                println!("✓ Card {} returned to inventory", code);
            } else {
                println!("⚠️  Card {} is unknown or unused", code);
            }
        }
        Command::CheckDenominations => {}
    }

    Ok(())
}

fn print_outcome(outcome: &ClaimOutcome) {
    let marker = if outcome.is_success() { "🎉" } else { "❌" };
    println!("{} {}", marker, outcome.message());

    if let (Some(nickname), Some(target)) = (outcome.nickname(), outcome.target()) {
        println!("   {} · amount {}", nickname, target);
    }
    for code in outcome.codes() {
        println!("   {}", code);
    }
}
