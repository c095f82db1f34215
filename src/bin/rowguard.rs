use clap::{Parser, Subcommand, ValueEnum};
use rowguard::{
    Branch, Config, ScopeKind, Tenant,
    schema::SchemaPlan,
    tools::{CatalogTools, DEFAULT_MEMBER_LIMIT, DEFAULT_SCOPE_LIMIT},
    verify::{self, VerifyOptions},
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rowguard", version, about = "Row-level scope isolation for Postgres")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API for the configured deployment
    Serve,

    /// Show planned DDL, policy and grant changes without applying
    SchemaPlan,

    /// Apply DDL, policy and grant changes
    SchemaSync,

    /// Seed known rows and check what each binding can see
    VerifyIsolation {
        /// Remove seeded rows and deactivate the verify scopes afterwards
        #[arg(long)]
        cleanup: bool,

        /// Also check branch isolation
        #[arg(long)]
        branches: bool,
    },

    /// Manage the scope catalog
    Scopes {
        #[arg(long, value_enum, default_value_t = KindArg::Tenant)]
        kind: KindArg,

        #[command(subcommand)]
        command: ScopeCommands,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Tenant,
    Branch,
}

#[derive(Subcommand, Debug)]
enum ScopeCommands {
    List {
        #[arg(long, default_value_t = DEFAULT_SCOPE_LIMIT)]
        limit: i64,
    },
    Get {
        id: String,
    },
    Create {
        name: String,
        slug: String,
        #[arg(long)]
        description: Option<String>,
    },
    Members {
        id: String,
        #[arg(long, default_value_t = DEFAULT_MEMBER_LIMIT)]
        limit: i64,
    },
    AddMember {
        id: String,
        username: String,
        #[arg(long)]
        email: Option<String>,
    },
    Stats,
    Activate {
        id: String,
    },
    Deactivate {
        id: String,
    },
}

#[tokio::main]
async fn main() -> rowguard::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = cli.config.database_url() {
        eprintln!("error: {err}");
        std::process::exit(2);
    }

    match cli.command {
        Commands::Serve => rowguard::http::serve(&cli.config).await?,
        Commands::SchemaPlan => {
            let store = cli.config.connect().await?;
            let plan = store.schema().plan(&cli.config.schema_config()).await?;
            print_plan(&plan);
        }
        Commands::SchemaSync => {
            let store = cli.config.connect().await?;
            let plan = store.schema().sync(&cli.config.schema_config()).await?;
            if plan.is_empty() {
                println!("No changes needed.");
            } else {
                println!("Applied changes:");
                print_plan(&plan);
            }
        }
        Commands::VerifyIsolation { cleanup, branches } => {
            let store = cli.config.connect().await?;
            let report = verify::verify_isolation(
                &store,
                VerifyOptions {
                    include_branches: branches,
                },
            )
            .await?;
            if cleanup {
                verify::cleanup(&store).await?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Scopes { kind, command } => {
            let store = cli.config.connect().await?;
            let out = match kind {
                KindArg::Tenant => run_scope_command(store.tools::<Tenant>(), command).await,
                KindArg::Branch => run_scope_command(store.tools::<Branch>(), command).await,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
            if out["success"] != Value::Bool(true) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn run_scope_command<K: ScopeKind>(tools: CatalogTools<K>, command: ScopeCommands) -> Value {
    match command {
        ScopeCommands::List { limit } => tools.list_scopes(limit).await,
        ScopeCommands::Get { id } => tools.get_scope(&id).await,
        ScopeCommands::Create {
            name,
            slug,
            description,
        } => tools.create_scope(&name, &slug, description.as_deref()).await,
        ScopeCommands::Members { id, limit } => tools.list_scope_members(&id, limit).await,
        ScopeCommands::AddMember {
            id,
            username,
            email,
        } => tools.add_scope_member(&id, &username, email.as_deref()).await,
        ScopeCommands::Stats => tools.scope_stats().await,
        ScopeCommands::Activate { id } => tools.set_scope_active(&id, true).await,
        ScopeCommands::Deactivate { id } => tools.set_scope_active(&id, false).await,
    }
}

fn print_plan(plan: &SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {w}");
        }
    }

    if plan.actions().is_empty() {
        println!("No pending changes.");
        return;
    }

    println!("Actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
