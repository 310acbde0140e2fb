use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use task_tracker::task::{parse_filter, Task, TaskFilters, TaskFormData, TaskPriority, TaskStatus};
use task_tracker::{ApiError, AppState, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "task-tracker")]
#[command(about = "Track tasks against a remote task server", long_about = None)]
struct Cli {
    /// API root, e.g. http://localhost:8080/api
    #[arg(long, env = "TASK_TRACKER_API_URL", global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and remember the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "TASK_TRACKER_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and log in
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "TASK_TRACKER_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// List tasks, optionally filtered
    List {
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Show one task
    Show { id: i64 },
    /// Create a task
    Create {
        #[command(flatten)]
        fields: TaskArgs,
    },
    /// Replace the fields of a task
    Update {
        id: i64,
        #[command(flatten)]
        fields: TaskArgs,
    },
    /// Delete a task
    Delete { id: i64 },
    /// Download matching tasks as a spreadsheet
    Export {
        #[command(flatten)]
        filters: FilterArgs,
        /// Directory to write tasks_<date>.xlsx into
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Text matched against title and description
    #[arg(long)]
    search: Option<String>,
    /// TODO, IN_PROGRESS, DONE or any
    #[arg(long, default_value = "any")]
    status: String,
    /// LOW, MEDIUM, HIGH or any
    #[arg(long, default_value = "any")]
    priority: String,
}

impl FilterArgs {
    fn to_filters(&self) -> anyhow::Result<TaskFilters> {
        Ok(TaskFilters {
            search: self.search.clone(),
            status: parse_filter(&self.status).map_err(anyhow::Error::msg)?,
            priority: parse_filter(&self.priority).map_err(anyhow::Error::msg)?,
        }
        .normalized())
    }
}

#[derive(clap::Args)]
struct TaskArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, default_value = "TODO")]
    status: TaskStatus,
    #[arg(long, default_value = "MEDIUM")]
    priority: TaskPriority,
    /// Due date, YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS
    #[arg(long)]
    due: Option<String>,
}

impl TaskArgs {
    fn to_form(&self) -> anyhow::Result<TaskFormData> {
        let due_date = self.due.as_deref().map(parse_due).transpose()?;
        let mut form = TaskFormData::new(self.title.as_str())
            .status(self.status)
            .priority(self.priority)
            .due_date(due_date);
        if let Some(description) = &self.description {
            form = form.description(description.as_str());
        }
        Ok(form)
    }
}

fn parse_due(value: &str) -> anyhow::Result<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt);
    }
    let date = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid due date '{}'", value))?;
    date.and_hms_opt(0, 0, 0)
        .with_context(|| format!("invalid due date '{}'", value))
}

// Current-thread runtime: the client never needs parallel workers
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,task_tracker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env()?;
    if let Some(api_url) = cli.api_url {
        config.api_base_url = api_url.trim_end_matches('/').to_string();
    }

    let app = AppState::new(config)?;
    if let Err(e) = run(&app, cli.command).await {
        if let Some(ApiError::Unauthorized) = e.downcast_ref::<ApiError>() {
            // Let the forced logout reach storage before the process exits
            let _ = tokio::time::timeout(Duration::from_secs(1), app.session.signed_out()).await;
            bail!("session expired, please log in again with `task-tracker login`");
        }
        return Err(e);
    }
    Ok(())
}

async fn run(app: &AppState, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Login { email, password } => {
            let user = app.session.login(&email, &password).await?;
            println!("Logged in as {} <{}>", user.name, user.email);
        }
        Command::Register {
            name,
            email,
            password,
        } => {
            let user = app.session.register(&name, &email, &password).await?;
            println!("Registered and logged in as {} <{}>", user.name, user.email);
        }
        Command::Logout => {
            app.session.logout();
            println!("Logged out");
        }
        Command::Whoami => match app.session.current_user() {
            Some(user) => println!("{} <{}>", user.name, user.email),
            None => println!("Not logged in"),
        },
        Command::List { filters } => {
            require_session(app)?;
            let tasks = app.tasks.tasks(&filters.to_filters()?).await?;
            if tasks.is_empty() {
                println!("No tasks found");
            }
            for task in tasks.iter() {
                println!("{}", summary(task));
            }
        }
        Command::Show { id } => {
            require_session(app)?;
            let task = app.tasks.task(id).await?;
            print_details(&task);
        }
        Command::Create { fields } => {
            require_session(app)?;
            let task = app.tasks.create(fields.to_form()?).await?;
            println!("Created {}", summary(&task));
        }
        Command::Update { id, fields } => {
            require_session(app)?;
            let task = app.tasks.update(id, fields.to_form()?).await?;
            println!("Updated {}", summary(&task));
        }
        Command::Delete { id } => {
            require_session(app)?;
            app.tasks.delete(id).await?;
            println!("Deleted task #{}", id);
        }
        Command::Export { filters, dir } => {
            require_session(app)?;
            let path = app.tasks.export_to_dir(&filters.to_filters()?, &dir).await?;
            println!("Exported to {}", path.display());
        }
    }
    Ok(())
}

fn require_session(app: &AppState) -> anyhow::Result<()> {
    if !app.session.is_authenticated() {
        bail!("not logged in, run `task-tracker login` first");
    }
    Ok(())
}

fn summary(task: &Task) -> String {
    format!(
        "#{:<4} [{:<11}] {:<6} {}",
        task.id, task.status, task.priority, task.title
    )
}

fn print_details(task: &Task) {
    println!("{}", summary(task));
    if let Some(description) = &task.description {
        println!("  {}", description);
    }
    if let Some(due) = task.due_date {
        println!("  due:     {}", due.format("%Y-%m-%d %H:%M"));
    }
    println!("  created: {}", task.created_at.format("%Y-%m-%d %H:%M"));
    println!("  updated: {}", task.updated_at.format("%Y-%m-%d %H:%M"));
}
