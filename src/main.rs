use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use school_admin::accounts::{self, AccountPolicy, StaffAccountForm, StudentForm};
use school_admin::config::{self, Config};
use school_admin::credentials;
use school_admin::db;
use school_admin::entitlements::{AppRef, EntitlementService};
use school_admin::events::EventBus;
use school_admin::export::{self, Entity};
use school_admin::gateway::ApiGateway;
use school_admin::model::{EnrollmentStatus, Role, UserProfile};
use school_admin::realtime::{NotificationEvent, NotificationFeed};
use school_admin::services::{self, enrollment, notifications, schools, users};
use school_admin::session::SessionManager;
use school_admin::supabase::SupabaseClient;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in with a password (admin, principal) or a PIN (other roles)
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long, conflicts_with = "pin")]
        password: Option<String>,
        #[arg(long)]
        pin: Option<String>,
    },
    SignOut,
    Whoami,
    Schools,
    Users {
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        class_id: Option<Uuid>,
        #[arg(long)]
        active_only: bool,
    },
    /// Check a school's access to an app (id or slug)
    Access {
        #[arg(long)]
        school: Uuid,
        #[arg(long)]
        app: String,
        #[arg(long)]
        feature: Option<String>,
        /// Keep polling and print each check
        #[arg(long, conflicts_with = "feature")]
        watch: bool,
    },
    Apps,
    /// Create a teacher, secretary or principal account
    CreateStaff {
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        school: Uuid,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        class_id: Option<Uuid>,
    },
    /// Create a student account and print its PIN
    AddStudent {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        school: Uuid,
        #[arg(long)]
        class_id: Option<Uuid>,
        #[arg(long)]
        parent_phone: Option<String>,
    },
    Enrollment {
        #[command(subcommand)]
        command: EnrollmentCommand,
    },
    /// Issue a new PIN for a PIN-based account
    ResetPin {
        user: Uuid,
    },
    PasswordCheck {
        password: String,
    },
    /// Generate a PIN, or a password with --password
    Pin {
        #[arg(long, default_value_t = credentials::DEFAULT_PIN_LENGTH)]
        length: usize,
        #[arg(long)]
        password: bool,
    },
    Template {
        entity: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Validate an import spreadsheet
    Import {
        entity: String,
        file: PathBuf,
    },
    Export {
        entity: String,
        #[arg(long, value_enum, default_value_t = Format::Xlsx)]
        format: Format,
        #[arg(long)]
        out: PathBuf,
    },
    Notifications {
        #[command(subcommand)]
        command: NotificationCommand,
    },
}

#[derive(Debug, Subcommand)]
enum EnrollmentCommand {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Create the student account and mark the request approved
    Approve {
        id: Uuid,
        #[arg(long)]
        class_id: Option<Uuid>,
    },
    Reject {
        id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum NotificationCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    MarkRead {
        id: Uuid,
    },
    MarkAllRead,
    /// Stream live notification changes until interrupted
    Watch,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Xlsx,
    Pdf,
}

struct Console {
    cfg: Config,
    client: SupabaseClient,
    gateway: ApiGateway,
    sessions: SessionManager,
}

impl Console {
    async fn open(path: &Path) -> Result<Self> {
        let cfg = config::load(Some(path))
            .with_context(|| format!("load config {}", path.display()))?;
        cfg.ensure_dirs()?;

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| db::store_url(Path::new(&cfg.resolved_data_dir())));
        let pool = db::init_pool(&database_url).await?;
        db::run_migrations(&pool).await?;

        let client = SupabaseClient::from_config(&cfg)?;
        let gateway = ApiGateway::with_ttl(Arc::new(client.clone()), EventBus::new(), cfg.cache_ttl());
        let sessions = SessionManager::new(
            Arc::new(client.clone()),
            gateway.clone(),
            pool,
            cfg.profile_cache_ttl(),
        );
        Ok(Self {
            cfg,
            client,
            gateway,
            sessions,
        })
    }

    async fn caller(&self) -> Result<UserProfile> {
        let state = self
            .sessions
            .bootstrap()
            .await?
            .ok_or_else(|| anyhow!("not signed in; run `sign-in` first"))?;
        Ok(state.profile)
    }
}

fn parse_role(raw: &str) -> Result<Role> {
    Role::parse_role(raw).ok_or_else(|| anyhow!("unknown role {}", raw))
}

fn print_profile(p: &UserProfile) {
    println!(
        "{}  {:<28} {:<10} {}{}",
        p.id,
        p.full_name,
        p.role.as_str(),
        p.email.as_deref().unwrap_or("-"),
        if p.is_active { "" } else { "  (inactive)" }
    );
}

async fn export_rows(gw: &ApiGateway, caller: &UserProfile, entity: Entity) -> Result<Vec<Value>> {
    let role = match entity {
        Entity::Students => Some(Role::Student),
        Entity::Teachers => Some(Role::Teacher),
        Entity::Parents => Some(Role::Parent),
        Entity::Staff | Entity::Users => None,
    };
    let filter = users::UserFilter {
        role,
        ..Default::default()
    };
    let rows = users::list(gw, caller, &filter)
        .await?
        .into_iter()
        .filter(|u| {
            entity != Entity::Staff || matches!(u.role, Role::Principal | Role::Secretary | Role::Teacher)
        })
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn run_offline(command: &Command) -> Result<bool> {
    match command {
        Command::PasswordCheck { password } => {
            let strength = credentials::check_password_strength(password);
            println!(
                "score {}/7 - {}",
                strength.score,
                if strength.is_strong { "strong" } else { "weak" }
            );
            for issue in &strength.issues {
                println!("  - {}", issue.message());
            }
        }
        Command::Pin { length, password } => {
            let secret = if *password {
                credentials::generate_password(*length)?
            } else {
                credentials::generate_secure_pin(*length)?
            };
            println!("{}", secret);
        }
        Command::Template { entity, out } => {
            let entity: Entity = entity.parse()?;
            let bytes = export::generate_import_template(entity)?;
            fs::write(out, bytes).with_context(|| format!("write {}", out.display()))?;
            info!(entity = %entity, path = %out.display(), "template written");
        }
        Command::Import { entity, file } => {
            let entity: Entity = entity.parse()?;
            let bytes = fs::read(file).with_context(|| format!("read {}", file.display()))?;
            let rows = export::parse_import_file(&bytes)?;
            let issues = export::validate_import_rows(entity, &rows);
            println!("{} rows, {} with problems", rows.len(), issues.len());
            for issue in &issues {
                println!("  line {}: missing {}", issue.line, issue.missing.join(", "));
            }
            if !issues.is_empty() {
                bail!("import file has {} invalid rows", issues.len());
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if run_offline(&args.command)? {
        return Ok(());
    }

    let console = Console::open(&args.config).await?;
    let gw = &console.gateway;

    match args.command {
        Command::SignIn {
            email,
            password,
            pin,
        } => {
            let state = match (password, pin) {
                (Some(password), _) => console.sessions.sign_in_password(&email, &password).await?,
                (None, Some(pin)) => console.sessions.sign_in_pin(&email, &pin).await?,
                (None, None) => bail!("pass --password or --pin"),
            };
            println!(
                "signed in as {} ({}, {} sign-in)",
                state.profile.full_name,
                state.profile.role.as_str(),
                state.profile.role.auth_path()
            );
        }
        Command::SignOut => console.sessions.sign_out().await?,
        Command::Whoami => match console.sessions.bootstrap().await? {
            Some(state) => print_profile(&state.profile),
            None => println!("not signed in"),
        },
        Command::Schools => {
            let caller = console.caller().await?;
            for school in schools::list(gw, &caller).await? {
                println!(
                    "{}  {}{}",
                    school.id,
                    school.name,
                    if school.is_active { "" } else { "  (inactive)" }
                );
            }
        }
        Command::Users {
            role,
            search,
            class_id,
            active_only,
        } => {
            let caller = console.caller().await?;
            let filter = users::UserFilter {
                role: role.as_deref().map(parse_role).transpose()?,
                class_id,
                search,
                active_only,
            };
            for user in users::list(gw, &caller, &filter).await? {
                print_profile(&user);
            }
        }
        Command::Access {
            school,
            app,
            feature,
            watch,
        } => {
            let app = match Uuid::parse_str(&app) {
                Ok(id) => AppRef::Id(id),
                Err(_) => AppRef::Slug(app),
            };
            let entitlements = EntitlementService::new(gw.clone());
            if watch {
                let mut watcher =
                    entitlements.watch_app_access(school, app, console.cfg.poll_interval());
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        changed = watcher.changed() => match changed {
                            Some(access) => println!("{}", serde_json::to_string(&access)?),
                            None => break,
                        },
                    }
                }
                return Ok(());
            }
            let report = match feature {
                Some(feature) => serde_json::to_value(
                    entitlements.check_feature_access(school, &app, &feature).await,
                )?,
                None => serde_json::to_value(entitlements.check_app_access(school, &app).await)?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Apps => {
            for app in services::apps::catalog(gw).await? {
                println!(
                    "{:<20} {}{}",
                    app.slug,
                    app.name,
                    if app.is_core { "  (core)" } else { "" }
                );
            }
        }
        Command::CreateStaff {
            email,
            first_name,
            last_name,
            role,
            school,
            phone,
            class_id,
        } => {
            let caller = console.caller().await?;
            let bearer = console.sessions.access_token().await?;
            let form = StaffAccountForm {
                email,
                password: None,
                first_name,
                last_name,
                phone,
                role: parse_role(&role)?,
                school_id: school,
                class_id,
            };
            let created = accounts::create_staff_account(
                gw,
                &console.cfg.supabase.staff_account_function,
                &bearer,
                &caller,
                &form,
            )
            .await?;
            println!("created {} with password {}", created.user_id, created.password);
        }
        Command::AddStudent {
            first_name,
            last_name,
            school,
            class_id,
            parent_phone,
        } => {
            let caller = console.caller().await?;
            let form = StudentForm {
                first_name,
                last_name,
                school_id: school,
                class_id,
                parent_email: None,
                parent_phone,
            };
            let created =
                accounts::create_student(gw, &caller, &form, &AccountPolicy::default()).await?;
            println!("created {} with PIN {}", created.profile.id, created.pin);
        }
        Command::Enrollment { command } => {
            let caller = console.caller().await?;
            match command {
                EnrollmentCommand::List { status } => {
                    let status = match status.as_deref() {
                        None => None,
                        Some("pending") => Some(EnrollmentStatus::Pending),
                        Some("approved") => Some(EnrollmentStatus::Approved),
                        Some("rejected") => Some(EnrollmentStatus::Rejected),
                        Some(other) => bail!("unknown status {}", other),
                    };
                    for request in enrollment::list(gw, &caller, status).await? {
                        println!(
                            "{}  {} {:<20} {}",
                            request.id,
                            request.student_first_name,
                            request.student_last_name,
                            request.status.as_str()
                        );
                    }
                }
                EnrollmentCommand::Approve { id, class_id } => {
                    let approved =
                        enrollment::approve(gw, &caller, id, class_id, &AccountPolicy::default())
                            .await?;
                    println!(
                        "approved; student {} has PIN {}",
                        approved.student.profile.id, approved.student.pin
                    );
                }
                EnrollmentCommand::Reject { id, reason } => {
                    enrollment::reject(gw, &caller, id, reason.as_deref()).await?;
                    println!("rejected {}", id);
                }
            }
        }
        Command::ResetPin { user } => {
            let caller = console.caller().await?;
            let pin = accounts::reset_pin(gw, &caller, user, &AccountPolicy::default()).await?;
            println!("new PIN {}", pin);
        }
        Command::Export {
            entity,
            format,
            out,
        } => {
            let caller = console.caller().await?;
            let entity: Entity = entity.parse()?;
            let rows = export_rows(gw, &caller, entity).await?;
            let bytes = match format {
                Format::Xlsx => export::export_xlsx(entity, &rows)?,
                Format::Pdf => export::export_pdf(entity, entity.label(), &rows)?,
            };
            fs::write(&out, bytes).with_context(|| format!("write {}", out.display()))?;
            info!(entity = %entity, rows = rows.len(), path = %out.display(), "export written");
        }
        Command::Notifications { command } => {
            let caller = console.caller().await?;
            match command {
                NotificationCommand::List { limit } => {
                    for n in notifications::list(gw, &caller, caller.id, limit).await? {
                        println!(
                            "{} {} {}: {}",
                            if n.is_read { " " } else { "*" },
                            n.created_at.format("%Y-%m-%d %H:%M"),
                            n.title,
                            n.message
                        );
                    }
                }
                NotificationCommand::MarkRead { id } => {
                    notifications::mark_read(gw, &caller, id).await?;
                }
                NotificationCommand::MarkAllRead => {
                    let n = notifications::mark_all_read(gw, &caller).await?;
                    println!("{} marked read", n);
                }
                NotificationCommand::Watch => {
                    let token = console.sessions.access_token().await.ok();
                    let feed = NotificationFeed::new(
                        console.client.base_url(),
                        console.client.anon_key(),
                        token,
                    )?;
                    let mut sub = feed.subscribe(caller.id).await?;
                    info!(user_id = %caller.id, "watching notifications; ctrl-c to stop");
                    loop {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => break,
                            event = sub.recv() => match event {
                                Some(NotificationEvent::Inserted(n)) => println!("new: {}: {}", n.title, n.message),
                                Some(NotificationEvent::Updated(n)) => println!("updated: {}", n.title),
                                Some(NotificationEvent::Deleted { id }) => println!("deleted: {:?}", id),
                                None => {
                                    warn!("notification channel closed");
                                    break;
                                }
                            },
                        }
                    }
                    sub.close().await;
                }
            }
        }
        Command::PasswordCheck { .. }
        | Command::Pin { .. }
        | Command::Template { .. }
        | Command::Import { .. } => {}
    }
    Ok(())
}
