//! CLI entry point for `galsync`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use galsync::backend::fixture::{load_backends, Backends};
use galsync::config::Config;
use galsync::filter::eval::matches;
use galsync::filter::input::parse_filter_json;
use galsync::filter::ldap::to_ldap_filter;
use galsync::filter::mailbox::to_mailbox_query;
use galsync::model::account::AuthToken;
use galsync::model::gal::GalSearchType;
use galsync::search::GalResponse;
use galsync::service::{AutoCompleteGalRequest, GalService, SearchGalRequest, SyncGalRequest};
use galsync::token::GalSyncToken;

#[derive(Parser)]
#[command(
    name = "galsync",
    version,
    about = "Search, autocomplete and sync a Global Address List"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Fixture describing domains, accounts, directory and mailboxes
    #[arg(long, global = true, env = "GALSYNC_FIXTURE", value_name = "FILE")]
    fixture: Option<PathBuf>,

    /// Account to act as, by id or name
    #[arg(long = "as", global = true, value_name = "ACCOUNT")]
    account: Option<String>,

    /// Act with an admin token (skips GAL feature checks)
    #[arg(long, global = true)]
    admin: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the GAL
    Search {
        /// Search key ("." matches everything)
        query: Option<String>,
        #[arg(long = "type", default_value = "all")]
        search_type: GalSearchType,
        #[arg(short, long)]
        limit: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long)]
        sort_by: Option<String>,
        /// Fetch one entry by directory DN
        #[arg(long)]
        dn: Option<String>,
        /// Structured filter as JSON (`{"conds":[...],"cond":[...]}`)
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        gal_account: Option<String>,
        /// Match the key exactly instead of as a substring
        #[arg(long)]
        no_wildcard: bool,
        /// Report whether each group can be expanded
        #[arg(long)]
        expand: bool,
    },
    /// Complete a name prefix from the GAL
    Autocomplete {
        name: String,
        #[arg(long = "type", default_value = "all")]
        search_type: GalSearchType,
        #[arg(short, long)]
        limit: Option<u32>,
        #[arg(long)]
        gal_account: Option<String>,
        #[arg(long)]
        expand: bool,
    },
    /// Fetch GAL changes since a sync token
    Sync {
        #[arg(long)]
        token: Option<String>,
        #[arg(short, long, default_value_t = 0)]
        limit: u32,
        #[arg(long)]
        ldap_limit: Option<u32>,
        #[arg(long)]
        id_only: bool,
        /// Report how many changes remain
        #[arg(long)]
        count: bool,
        #[arg(long)]
        gal_account: Option<String>,
        /// Keep syncing until no more changes are pending
        #[arg(long)]
        all: bool,
    },
    /// Inspect sync tokens
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
    /// Compile a structured filter and evaluate it against the directory
    Filter {
        /// Filter as JSON
        json: String,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Subcommand)]
enum TokenCommand {
    /// Show the parts of a token
    Parse { token: String },
    /// Merge two tokens
    Merge { first: String, second: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = galsync::config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let json = cli.json || config.output.is_json();

    match &cli.command {
        Commands::Completions { shell } => cmd_completions(*shell),
        Commands::Manpage => cmd_manpage(),
        Commands::Token { command } => cmd_token(command, json),
        Commands::Filter { json: filter } => cmd_filter(&cli, &config, filter, json),
        Commands::Search {
            query,
            search_type,
            limit,
            offset,
            sort_by,
            dn,
            filter,
            gal_account,
            no_wildcard,
            expand,
        } => {
            let search_filter = match filter {
                Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
                    anyhow::anyhow!("malformed filter: {e}")
                })?),
                None => None,
            };
            let request = SearchGalRequest {
                name: query.clone(),
                search_type: *search_type,
                limit: limit.unwrap_or(config.gal.default_limit),
                offset: *offset,
                sort_by: sort_by.clone(),
                entry_dn: dn.clone(),
                gal_account_id: gal_account.clone(),
                search_filter,
                need_can_expand: *expand,
                wildcard: Some(!no_wildcard),
            };
            let (service, auth) = open_service(&cli, &config)?;
            let response = service.search_gal(&auth, &request)?;
            print_response(&response, &config, json)
        }
        Commands::Autocomplete {
            name,
            search_type,
            limit,
            gal_account,
            expand,
        } => {
            let request = AutoCompleteGalRequest {
                name: name.clone(),
                search_type: *search_type,
                limit: limit.unwrap_or(config.gal.default_limit),
                gal_account_id: gal_account.clone(),
                need_can_expand: *expand,
            };
            let (service, auth) = open_service(&cli, &config)?;
            let response = service.autocomplete_gal(&auth, &request)?;
            print_response(&response, &config, json)
        }
        Commands::Sync {
            token,
            limit,
            ldap_limit,
            id_only,
            count,
            gal_account,
            all,
        } => {
            let request = SyncGalRequest {
                token: token.clone(),
                limit: *limit,
                ldap_limit: *ldap_limit,
                id_only: *id_only,
                get_count: *count,
                gal_account_id: gal_account.clone(),
            };
            let (service, auth) = open_service(&cli, &config)?;
            if *all {
                cmd_sync_all(&service, &auth, request, &config, json)
            } else {
                let response = service.sync_gal(&auth, &request)?;
                print_response(&response, &config, json)
            }
        }
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_dir = galsync::config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "galsync.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "galsync", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn fixture_path(cli: &Cli, config: &Config) -> anyhow::Result<PathBuf> {
    cli.fixture
        .clone()
        .or_else(|| config.gal.fixture.clone())
        .ok_or_else(|| anyhow::anyhow!("no fixture given (use --fixture or gal.fixture)"))
}

fn load(path: &Path) -> anyhow::Result<Backends> {
    if !path.exists() {
        anyhow::bail!("fixture not found: {}", path.display());
    }
    Ok(load_backends(path)?)
}

/// Load the fixture and resolve the caller.
fn open_service(cli: &Cli, config: &Config) -> anyhow::Result<(GalService, AuthToken)> {
    let backends = load(&fixture_path(cli, config)?)?;
    let key = cli
        .account
        .clone()
        .or_else(|| config.gal.account.clone())
        .ok_or_else(|| anyhow::anyhow!("no account given (use --as or gal.account)"))?;
    let account = backends
        .provisioning
        .find_account(&key)
        .ok_or_else(|| anyhow::anyhow!("no such account: {key}"))?;
    let auth = if cli.admin {
        AuthToken::admin(account.id)
    } else {
        AuthToken::user(account.id)
    };
    Ok((GalService::new(backends.services()), auth))
}

/// Page through a sync until the server has nothing more.
fn cmd_sync_all(
    service: &GalService,
    auth: &AuthToken,
    mut request: SyncGalRequest,
    config: &Config,
    json: bool,
) -> anyhow::Result<()> {
    if request.limit == 0 {
        request.limit = config.gal.sync_page_size;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} Syncing {msg} ({elapsed})")
            .expect("valid template"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let start = Instant::now();
    let mut pages = 0u32;
    let mut contacts = 0usize;
    let mut deleted = 0usize;
    let last = loop {
        let response = service.sync_gal(auth, &request)?;
        pages += 1;
        contacts += response.contacts.len();
        deleted += response.deleted.len();
        pb.set_message(format!("{contacts} change(s), {pages} page(s)"));

        if !response.more || response.throttled || pages >= config.gal.max_sync_pages {
            break response;
        }
        if let Some(token) = &response.token {
            request.token = Some(token.clone());
        }
    };
    pb.finish_and_clear();

    if json {
        let summary = serde_json::json!({
            "pages": pages,
            "contacts": contacts,
            "deleted": deleted,
            "token": last.token,
            "more": last.more,
            "throttled": last.throttled,
            "full_sync_recommended": last.full_sync_recommended,
            "elapsed_ms": start.elapsed().as_millis(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!();
        println!("  {:<25} {}", "Pages", pages);
        println!("  {:<25} {}", "Changed entries", contacts);
        println!("  {:<25} {}", "Deleted entries", deleted);
        println!("  {:<25} {}", "Token", last.token.as_deref().unwrap_or("-"));
        if last.more {
            println!("  {:<25} {}", "Stopped early", "page limit reached");
        }
        if last.throttled {
            println!("  {:<25} {}", "Throttled", "yes");
        }
        println!("  {:<25} {:.2?}", "Elapsed", start.elapsed());
        println!();
    }
    Ok(())
}

fn cmd_token(command: &TokenCommand, json: bool) -> anyhow::Result<()> {
    let token = match command {
        TokenCommand::Parse { token } => GalSyncToken::parse(token),
        TokenCommand::Merge { first, second } => {
            let mut merged = GalSyncToken::parse(first);
            merged.merge(&GalSyncToken::parse(second));
            merged
        }
    };
    let internal = token.internal_cursor();
    let external = token.external_cursor();

    if json {
        let out = serde_json::json!({
            "token": token.to_string(),
            "directory": token.ldap_timestamp(),
            "change_ids": token.change_ids(),
            "mailbox_sync": token.does_mailbox_sync(),
            "internal_cursor": internal.encode(),
            "external_cursor": external.encode(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {:<25} {}", "Token", token);
    println!("  {:<25} {}", "Directory segment", token.ldap_timestamp());
    println!("  {:<25} {}", "Mailbox sync", token.does_mailbox_sync());
    if !internal.is_empty() {
        println!(
            "  {:<25} {} (matched {}, more {})",
            "Internal cursor", internal.timestamp, internal.match_count, internal.has_more
        );
    }
    if !external.is_empty() {
        println!(
            "  {:<25} {} (matched {}, more {})",
            "External cursor", external.timestamp, external.match_count, external.has_more
        );
    }
    for (account, change_id) in token.change_ids() {
        println!("  {:<25} {}", account, change_id);
    }
    println!();
    Ok(())
}

fn cmd_filter(cli: &Cli, config: &Config, raw: &str, json: bool) -> anyhow::Result<()> {
    let term = parse_filter_json(raw)?;
    let ldap = to_ldap_filter(&term);
    let mailbox = to_mailbox_query(&term);

    // Evaluation needs a fixture; compilation does not.
    let matched: Option<Vec<String>> = match fixture_path(cli, config) {
        Ok(path) => {
            let backends = load(&path)?;
            Some(
                backends
                    .directory
                    .entries()
                    .into_iter()
                    .filter(|e| matches(&term, e))
                    .map(|e| e.dn)
                    .collect(),
            )
        }
        Err(_) => None,
    };

    if json {
        let out = serde_json::json!({
            "ldap": ldap,
            "mailbox": mailbox,
            "matches": matched,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {:<10} {}", "LDAP", ldap);
    println!("  {:<10} {}", "Mailbox", mailbox);
    if let Some(dns) = matched {
        println!();
        println!("  {} matching entr{}", dns.len(), if dns.len() == 1 { "y" } else { "ies" });
        for dn in dns {
            println!("    {dn}");
        }
    }
    println!();
    Ok(())
}

/// Print a response as a table or JSON.
fn print_response(response: &GalResponse, config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    if let Some(fault) = &response.fault {
        println!("  Peer fault {}: {}", fault.code, fault.message);
        return Ok(());
    }

    let columns = &config.output.columns;
    println!();
    println!("  {} result(s)", response.contacts.len());
    println!();

    if !response.contacts.is_empty() {
        let mut header = format!("  {:<4} {:<30}", "#", "Id");
        for col in columns {
            header.push_str(&format!(" {:<28}", col));
        }
        println!("{header}");
        println!("  {}", "-".repeat(35 + 29 * columns.len()));

        for (i, entry) in response.contacts.iter().enumerate() {
            let id: String = entry.id.chars().take(29).collect();
            let mut line = format!("  {:<4} {:<30}", i + 1, id);
            for col in columns {
                let value: String = entry.attr(col).unwrap_or("").chars().take(27).collect();
                line.push_str(&format!(" {:<28}", value));
            }
            if let Some(exp) = entry.can_expand {
                line.push_str(if exp { "  [expandable]" } else { "  [not expandable]" });
            }
            println!("{line}");
        }
        println!();
    }

    if !response.deleted.is_empty() {
        println!("  {:<25} {}", "Deleted", response.deleted.join(", "));
    }
    if let Some(token) = &response.token {
        println!("  {:<25} {}", "Token", token);
    }
    if response.more {
        println!("  {:<25} {}", "More", "yes");
    }
    if let Some(remain) = response.remain {
        println!("  {:<25} {}", "Remaining", remain);
    }
    if response.throttled {
        println!("  {:<25} {}", "Throttled", "yes");
    }
    if response.full_sync_recommended {
        println!("  {:<25} {}", "Full sync recommended", "yes");
    }
    if let Some(ts) = &response.gal_definition_last_modified {
        println!("  {:<25} {}", "GAL definition modified", ts);
    }
    println!();
    Ok(())
}
