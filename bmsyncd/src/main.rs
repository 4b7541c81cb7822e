use anyhow::Context;
use bmsyncd::accounts::{AccountRegistry, AddAccountResult, AuthState};
use bmsyncd::daemon::{DaemonConfig, DaemonRuntime};
use bmsyncd::db;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    ListAccounts,
    AddNextcloud {
        server: String,
        login: String,
        app_password: String,
    },
    Enable(u64),
    Disable(u64),
    RemoveAccount(u64),
    Help,
}

const USAGE: &str = "\
Usage: bmsyncd [OPTION]
  --list-accounts                          List configured accounts
  --add-nextcloud <server> <login> <pass>  Add a Nextcloud account (app password)
  --enable <id> | --disable <id>           Toggle sync for an account
  --remove-account <id>                    Remove an account and its sync state
Without options the daemon syncs all enabled accounts. The account list is
read at startup: restart a running daemon after adding, removing, enabling
or disabling accounts.
";

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliMode::Run);
    };
    let mut value = |what: &str| {
        args.next()
            .with_context(|| format!("{first} expects {what}"))
    };
    let mode = match first.as_str() {
        "--list-accounts" => CliMode::ListAccounts,
        "--add-nextcloud" => CliMode::AddNextcloud {
            server: value("a server url")?,
            login: value("a login name")?,
            app_password: value("an app password")?,
        },
        "--enable" => CliMode::Enable(parse_id(&value("an account id")?)?),
        "--disable" => CliMode::Disable(parse_id(&value("an account id")?)?),
        "--remove-account" => CliMode::RemoveAccount(parse_id(&value("an account id")?)?),
        "--help" | "-h" => CliMode::Help,
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn parse_id(value: &str) -> anyhow::Result<u64> {
    value
        .parse()
        .with_context(|| format!("invalid account id: {value}"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("BMSYNC_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_registry(config: &DaemonConfig) -> anyhow::Result<AccountRegistry> {
    let pool = db::open_pool(&config.state_db)
        .await
        .with_context(|| format!("failed to open state database at {:?}", config.state_db))?;
    Ok(AccountRegistry::from_pool(pool))
}

async fn manage_accounts(mode: CliMode, config: &DaemonConfig) -> anyhow::Result<()> {
    let registry = open_registry(config).await?;
    match mode {
        CliMode::ListAccounts => {
            for account in registry.list_accounts().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    account.id,
                    account.backend.as_str(),
                    account.auth.username(),
                    if account.enabled { "enabled" } else { "disabled" }
                );
            }
        }
        CliMode::AddNextcloud {
            server,
            login,
            app_password,
        } => {
            let auth = AuthState::Nextcloud {
                server,
                login_name: login,
                app_password,
            };
            match registry.add_account(auth).await {
                AddAccountResult::Success(id) => println!("added account {id}"),
                AddAccountResult::AlreadyExists => println!("account already exists"),
                AddAccountResult::UnexpectedError => anyhow::bail!("failed to add account"),
            }
        }
        CliMode::Enable(id) => set_enabled(&registry, id, true).await?,
        CliMode::Disable(id) => set_enabled(&registry, id, false).await?,
        CliMode::RemoveAccount(id) => {
            if !registry.remove_account(id).await? {
                anyhow::bail!("no account with id {id}");
            }
            println!("removed account {id}");
        }
        CliMode::Run | CliMode::Help => {}
    }
    Ok(())
}

async fn set_enabled(registry: &AccountRegistry, id: u64, enabled: bool) -> anyhow::Result<()> {
    if !registry.set_enabled(id, enabled).await? {
        anyhow::bail!("no account with id {id}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let mode = parse_cli_mode(std::env::args())?;
    match mode {
        CliMode::Help => {
            print!("{USAGE}");
            Ok(())
        }
        CliMode::Run => {
            let config = DaemonConfig::from_env()?;
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await
        }
        other => manage_accounts(other, &DaemonConfig::from_env()?).await,
    }
}
