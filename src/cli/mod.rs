use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    background::{BackgroundEvent, BackgroundMessage},
    delivery::{
        DeliveryOutcome, DeliveryReport, DeliveryRequest, SensoryDeliverer, Tier,
        sensory::PopupAction,
    },
    error::{NotifyError, NotifyResult, OperationResult},
    foreground::NotificationCenter,
    monitor::{DueClassification, classify, due_state},
    notification::PushPayload,
    runtime::{NotifyRuntime, Surfaces},
    settings::Settings,
    store::MemoryTaskStore,
    types::Task,
};

const SCHEMA_VERSION: &str = "cli.v1";

#[derive(Debug, Clone, Subcommand)]
pub enum RootCommand {
    /// List overdue and due-today tasks of a task file
    Classify(ClassifyArgs),
    /// Run one background due check over a task file
    Check(TaskFileArgs),
    /// Schedule alarms for a task file and deliver them until interrupted
    Watch(TaskFileArgs),
    Push {
        #[command(subcommand)]
        command: PushCommand,
    },
    /// Deliver an ad-hoc notification through the tier chain
    NotifyTest(NotifyTestArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum PushCommand {
    Subscribe,
    Unsubscribe,
    Status,
    Test,
}

#[derive(Debug, Clone, Args)]
pub struct TaskFileArgs {
    #[arg(long, value_name = "FILE")]
    pub tasks: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct ClassifyArgs {
    #[arg(long, value_name = "FILE")]
    pub tasks: PathBuf,

    #[arg(long, value_name = "RFC3339")]
    pub now: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct NotifyTestArgs {
    #[arg(long, value_name = "TEXT", default_value = "Test notification")]
    pub title: String,

    #[arg(long, value_name = "TEXT", default_value = "Notifications are working")]
    pub message: String,
}

pub async fn run(command: RootCommand, settings: &Settings, json_output: bool, quiet: bool) -> i32 {
    match execute(command, settings).await {
        Ok(output) => {
            print_success(output, json_output, quiet);
            0
        }
        Err(err) => {
            print_error(&err, json_output);
            err.exit_code
        }
    }
}

struct CommandOutput {
    command: &'static str,
    data: Value,
    text: String,
}

#[derive(Debug)]
struct CliError {
    exit_code: i32,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

type CliResult<T> = Result<T, CliError>;

async fn execute(command: RootCommand, settings: &Settings) -> CliResult<CommandOutput> {
    match command {
        RootCommand::Classify(args) => classify_tasks(args),
        RootCommand::Check(args) => check_tasks(settings, args).await,
        RootCommand::Watch(args) => watch_tasks(settings, args).await,
        RootCommand::Push { command } => execute_push_command(settings, command).await,
        RootCommand::NotifyTest(args) => notify_test(settings, args).await,
    }
}

fn load_store(path: &Path) -> CliResult<MemoryTaskStore> {
    if !path.exists() {
        return Err(not_found_error(
            "TASKS_NOT_FOUND",
            format!("task file {} not found", path.display()),
        ));
    }
    MemoryTaskStore::from_file(path)
        .map_err(|err| usage_error("INVALID_TASKS", format_anyhow_error_chain(&err)))
}

fn parse_now(raw: Option<&str>) -> CliResult<DateTime<Utc>> {
    let Some(raw) = raw else {
        return Ok(Utc::now());
    };
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| usage_error("INVALID_TIME", format!("--now {raw:?}: {err}")))
}

fn start_runtime(settings: &Settings, store: MemoryTaskStore) -> CliResult<NotifyRuntime> {
    NotifyRuntime::start(settings, Arc::new(store), Surfaces::system(settings))
        .map_err(|err| runtime_error(format_anyhow_error_chain(&err)))
}

fn classify_tasks(args: ClassifyArgs) -> CliResult<CommandOutput> {
    let now = parse_now(args.now.as_deref())?;
    let tasks = load_store(&args.tasks)?.snapshot();
    let classification = classify(now, &tasks);

    Ok(CommandOutput {
        command: "classify",
        data: json!({
            "now": now,
            "overdue": tasks_json(now, &classification.overdue),
            "due_today": tasks_json(now, &classification.due_today),
        }),
        text: render_classification_text(now, &classification),
    })
}

async fn check_tasks(settings: &Settings, args: TaskFileArgs) -> CliResult<CommandOutput> {
    let store = load_store(&args.tasks)?;
    let tasks = store.snapshot();
    let mut runtime = start_runtime(settings, store)?;
    let mut events = runtime
        .take_events()
        .ok_or_else(|| runtime_error("background events unavailable"))?;

    let outcome: NotifyResult<()> = async {
        runtime.background.ready().await?;
        runtime.background.update_tasks(tasks)?;
        runtime
            .background
            .request(BackgroundMessage::ImmediateTaskCheck)
            .await
    }
    .await;

    let mut rendered = Vec::new();
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            BackgroundEvent::Rendered { tag } => rendered.push(tag),
            BackgroundEvent::CheckCompleted { overdue, due_today } => {
                completed = Some((overdue, due_today))
            }
            _ => {}
        }
    }
    runtime.shutdown();
    outcome.map_err(notify_error)?;

    let (overdue, due_today) = completed.unwrap_or_default();
    let text = if rendered.is_empty() {
        format!(
            "{} overdue, {} due today, nothing new to announce",
            overdue.len(),
            due_today.len()
        )
    } else {
        format!(
            "{} overdue, {} due today, announced: {}",
            overdue.len(),
            due_today.len(),
            rendered.join(", ")
        )
    };

    Ok(CommandOutput {
        command: "check",
        data: json!({
            "overdue": overdue,
            "due_today": due_today,
            "announced": rendered,
        }),
        text,
    })
}

async fn watch_tasks(settings: &Settings, args: TaskFileArgs) -> CliResult<CommandOutput> {
    let store = load_store(&args.tasks)?;
    let mut runtime = start_runtime(settings, store)?;
    if let Err(err) = runtime.background.ready().await {
        warn!(error = %err, "background context unavailable; continuing without it");
    }

    let reader = spawn_input_reader(runtime.sensory.clone(), runtime.center.clone());
    runtime
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for interrupt");
            }
        })
        .await;
    reader.abort();

    let pending = runtime.center.scheduler().len();
    runtime.shutdown();
    info!(pending_alarms = pending, "watch stopped");

    Ok(CommandOutput {
        command: "watch",
        data: json!({ "pending_alarms": pending }),
        text: format!("stopped with {pending} pending alarm(s)"),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchInput {
    Popup(u64, PopupAction),
    Visible(bool),
    Push(PushPayload),
}

/// Reads watch commands from stdin: `<popup-id> <action>`, `hide`, `show` or `push <json>`.
fn spawn_input_reader(
    sensory: Arc<SensoryDeliverer>,
    center: Arc<NotificationCenter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match parse_watch_input(&line) {
                Ok(WatchInput::Popup(popup_id, action)) => {
                    if sensory.resolve(popup_id, action).is_none() {
                        warn!(popup_id, "no open popup with that id");
                    }
                }
                Ok(WatchInput::Visible(visible)) => center.set_visible(visible),
                Ok(WatchInput::Push(payload)) => {
                    if let Err(err) = center.receive_push(payload).await {
                        warn!(error = %err, "push not delivered");
                    }
                }
                Err(err) => warn!(input = %line, error = %err, "unrecognized watch input"),
            }
        }
    })
}

fn parse_watch_input(line: &str) -> NotifyResult<WatchInput> {
    let line = line.trim();
    match line {
        "hide" => return Ok(WatchInput::Visible(false)),
        "show" => return Ok(WatchInput::Visible(true)),
        _ => {}
    }
    if let Some(raw) = line.strip_prefix("push ") {
        return PushPayload::decode(raw.trim()).map(WatchInput::Push);
    }
    parse_popup_command(line)
        .map(|(popup_id, action)| WatchInput::Popup(popup_id, action))
        .ok_or_else(|| {
            NotifyError::Protocol(
                "expected '<popup-id> <dismiss|complete|snooze>', 'hide', 'show' or 'push <json>'"
                    .to_string(),
            )
        })
}

fn parse_popup_command(line: &str) -> Option<(u64, PopupAction)> {
    let mut parts = line.split_whitespace();
    let popup_id = parts.next()?.parse().ok()?;
    let action = PopupAction::from_str(parts.next()?).ok()?;
    parts.next().is_none().then_some((popup_id, action))
}

async fn execute_push_command(
    settings: &Settings,
    command: PushCommand,
) -> CliResult<CommandOutput> {
    let runtime = start_runtime(settings, MemoryTaskStore::new(Vec::new()))?;
    if let Err(err) = runtime.background.ready().await {
        warn!(error = %err, "background context unavailable");
    }

    let output = match command {
        PushCommand::Subscribe => {
            operation_output("push subscribe", runtime.push.subscribe().await)
        }
        PushCommand::Unsubscribe => {
            operation_output("push unsubscribe", runtime.push.unsubscribe().await)
        }
        PushCommand::Test => operation_output("push test", runtime.push.send_test().await),
        PushCommand::Status => {
            let info = runtime.push.debug_info();
            let text = format!(
                "subscribed: {}\ntoken: {}\nchannel: {}\npermission: {}",
                info.is_subscribed,
                if info.has_token { "present" } else { "none" },
                if info.channel_supported {
                    "configured"
                } else {
                    "unsupported"
                },
                info.notification_permission.as_str()
            );
            serde_json::to_value(&info)
                .map(|data| CommandOutput {
                    command: "push status",
                    data,
                    text,
                })
                .map_err(runtime_error)
        }
    };

    runtime.shutdown();
    output
}

fn operation_output(command: &'static str, result: OperationResult) -> CliResult<CommandOutput> {
    if !result.success {
        return Err(operation_error(result));
    }
    let text = result
        .token
        .as_ref()
        .map(|token| format!("token: {token}"))
        .unwrap_or_default();
    let data = serde_json::to_value(&result).map_err(runtime_error)?;
    Ok(CommandOutput {
        command,
        data,
        text,
    })
}

async fn notify_test(settings: &Settings, args: NotifyTestArgs) -> CliResult<CommandOutput> {
    let runtime = start_runtime(settings, MemoryTaskStore::new(Vec::new()))?;
    if let Err(err) = runtime.background.ready().await {
        warn!(error = %err, "background context unavailable");
    }

    let report = runtime
        .dispatcher
        .deliver(DeliveryRequest::Adhoc {
            title: args.title,
            body: args.message,
        })
        .await;
    runtime.shutdown();

    let text = render_report_text(&report);
    let data = serde_json::to_value(&report).map_err(runtime_error)?;
    Ok(CommandOutput {
        command: "notify-test",
        data,
        text,
    })
}

fn tasks_json(now: DateTime<Utc>, tasks: &[Task]) -> Value {
    Value::Array(
        tasks
            .iter()
            .map(|task| {
                json!({
                    "id": task.id,
                    "text": task.text,
                    "due_date": task.due_date,
                    "state": due_state(now, task),
                })
            })
            .collect(),
    )
}

fn render_classification_text(now: DateTime<Utc>, classification: &DueClassification) -> String {
    if classification.is_empty() {
        return "No due tasks.".to_string();
    }

    let headers = ["State", "ID", "Due", "Text"];
    let rows = classification
        .overdue
        .iter()
        .chain(classification.due_today.iter())
        .map(|task| {
            let state = match serde_json::to_value(due_state(now, task)) {
                Ok(Value::String(state)) => state,
                _ => String::new(),
            };
            let short_id = task.id.chars().take(8).collect::<String>();
            let due = task
                .due_date
                .map(|due| due.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            vec![state, short_id, due, task.text.replace('\n', " ")]
        })
        .collect::<Vec<_>>();

    render_text_table(&headers, &rows)
}

fn render_report_text(report: &DeliveryReport) -> String {
    let tier_name = |tier: Tier| match serde_json::to_value(tier) {
        Ok(Value::String(name)) => name,
        _ => "unknown".to_string(),
    };
    match report.outcome {
        DeliveryOutcome::Delivered(tier) => format!("delivered via {}", tier_name(tier)),
        DeliveryOutcome::FallbackDelivered(tier) => {
            format!("delivered via fallback {}", tier_name(tier))
        }
        DeliveryOutcome::FailedSilently => "no tier could deliver the notification".to_string(),
    }
}

fn render_text_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths = headers
        .iter()
        .map(|header| header.chars().count())
        .collect::<Vec<_>>();

    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            widths[index] = widths[index].max(cell.chars().count());
        }
    }

    let border = format!(
        "+{}+",
        widths
            .iter()
            .map(|width| "-".repeat(*width + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let format_row = |cells: Vec<&str>| {
        format!(
            "| {} |",
            cells
                .iter()
                .enumerate()
                .map(|(index, cell)| format!("{cell:<width$}", width = widths[index]))
                .collect::<Vec<_>>()
                .join(" | ")
        )
    };

    let mut lines = vec![border.clone(), format_row(headers.to_vec()), border.clone()];
    for row in rows {
        lines.push(format_row(row.iter().map(String::as_str).collect()));
    }
    lines.push(border);
    lines.join("\n")
}

fn usage_error(code: &'static str, message: impl Into<String>) -> CliError {
    CliError {
        exit_code: 2,
        code,
        message: message.into(),
        details: None,
    }
}

fn not_found_error(code: &'static str, message: impl Into<String>) -> CliError {
    CliError {
        exit_code: 3,
        code,
        message: message.into(),
        details: None,
    }
}

fn runtime_error(err: impl std::fmt::Display) -> CliError {
    CliError {
        exit_code: 5,
        code: "RUNTIME_ERROR",
        message: err.to_string(),
        details: None,
    }
}

fn notify_error(err: NotifyError) -> CliError {
    CliError {
        exit_code: 5,
        code: err.code(),
        message: err.to_string(),
        details: None,
    }
}

fn operation_error(result: OperationResult) -> CliError {
    CliError {
        exit_code: 5,
        code: result.code.unwrap_or("RUNTIME_ERROR"),
        message: result
            .error
            .unwrap_or_else(|| "operation failed".to_string()),
        details: None,
    }
}

fn print_success(output: CommandOutput, json_output: bool, quiet: bool) {
    if json_output {
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "command": output.command,
            "data": output.data
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(value) => println!("{value}"),
            Err(_) => println!("{}", payload),
        }
        return;
    }

    if quiet {
        return;
    }

    if output.text.is_empty() {
        println!("ok");
    } else {
        println!("{}", output.text);
    }
}

fn print_error(err: &CliError, json_output: bool) {
    error!(
        code = err.code,
        message = %err.message,
        details = ?err.details,
        "cli command failed"
    );

    if json_output {
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "error": {
                "code": err.code,
                "message": err.message,
                "details": err.details
            }
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(value) => eprintln!("{value}"),
            Err(_) => eprintln!("{}", payload),
        }
        return;
    }

    eprintln!("error[{}]: {}", err.code, err.message);
}

fn format_anyhow_error_chain(err: &anyhow::Error) -> String {
    let mut seen = HashSet::new();
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        if seen.insert(text.clone()) {
            parts.push(text);
        }
    }

    parts.join(": ")
}
