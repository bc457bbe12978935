//! tsk command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use directories::ProjectDirs;
use serde::Serialize;

use crate::bus::{BusEvent, Handler, Subscription, Topic};
use crate::config::{Config, CONFIG_FILE};
use crate::engine::SyncEngine;
use crate::error::{Error, Result};
use crate::events::{EventDestination, EventSink};
use crate::output::{emit_success, HumanOutput, OutputOptions};
use crate::remote::{FileStore, StorageUsage};
use crate::store::{TaskStore, TaskSummary};
use crate::task::{
    parse_due_date, NewTask, Priority, SortDirection, SortField, Status, Task, TaskFilter,
    TaskPatch,
};

/// Fill level at which commands start warning about the quota.
const USAGE_WARNING_PERCENT: u64 = 90;

pub struct GlobalOptions {
    pub store: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
    pub events: Option<String>,
}

impl GlobalOptions {
    fn output(&self) -> OutputOptions {
        let events_to_stdout = self
            .events
            .as_deref()
            .is_some_and(|value| value.trim() == "-");
        OutputOptions {
            json: self.json && !events_to_stdout,
            quiet: self.quiet || events_to_stdout,
        }
    }
}

pub struct AddOptions {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub due: Option<String>,
    pub link: Option<String>,
}

pub struct ListOptions {
    pub search: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub sort: String,
    pub asc: bool,
}

pub struct EditOptions {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub due: Option<String>,
    pub clear_due: bool,
    pub link: Option<String>,
    pub clear_link: bool,
}

#[derive(Serialize)]
struct ListOutput {
    total: usize,
    tasks: Vec<Task>,
}

#[derive(Serialize)]
struct DeletedOutput {
    id: String,
    title: String,
}

#[derive(Serialize)]
struct UsageOutput {
    path: String,
    bytes_in_use: u64,
    quota_bytes: u64,
    remaining: u64,
    percent: u64,
}

#[derive(Serialize)]
struct StatsOutput {
    #[serde(flatten)]
    summary: TaskSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<UsageOutput>,
}

/// An opened store plus everything a command needs around it.
struct Context {
    store: TaskStore,
    remote: FileStore,
    config: Config,
    output: OutputOptions,
    _events: Vec<Subscription>,
}

impl Context {
    async fn open(global: &GlobalOptions) -> Result<Self> {
        let config = match global.config.as_deref() {
            Some(path) => Config::load(path)?,
            None => Config::load_or_default(Path::new(CONFIG_FILE))?,
        };
        let path = store_path(global.store.clone(), &config)?;
        tracing::debug!(path = %path.display(), "opening store");
        let remote = FileStore::open(&path, config.storage.area.clone(), config.remote.limits())?;

        let engine = SyncEngine::new(
            Arc::new(remote.clone()),
            config.storage.clone(),
            crate::bus::EventBus::new(),
        )?;
        let events = match EventDestination::parse(global.events.as_deref()) {
            Some(destination) => EventSink::attach(engine.bus(), destination.open()?),
            None => Vec::new(),
        };
        let store = TaskStore::new(engine);
        store.initialize().await;

        Ok(Self {
            store,
            remote,
            config,
            output: global.output(),
            _events: events,
        })
    }

    /// Write pending changes before the process exits.
    async fn persist(&self) -> Result<()> {
        if self.store.flush().await {
            Ok(())
        } else {
            Err(Error::OperationFailed(format!(
                "changes could not be written to {} (run with RUST_LOG=tasksync=debug for details)",
                self.remote.path().display()
            )))
        }
    }

    async fn usage(&self) -> Option<UsageOutput> {
        self.store
            .engine()
            .usage()
            .await
            .map(|usage| usage_output(self.remote.path(), usage))
    }

    async fn push_usage_warning(&self, human: &mut HumanOutput) {
        if let Some(usage) = self.usage().await {
            if usage.percent >= USAGE_WARNING_PERCENT {
                human.push_warning(format!(
                    "store is {}% full ({} of {} bytes)",
                    usage.percent, usage.bytes_in_use, usage.quota_bytes
                ));
            }
        }
    }

    /// Resolve a full id or a unique id prefix.
    fn resolve(&self, raw: &str) -> Result<Task> {
        let needle = raw.trim().to_lowercase();
        if needle.is_empty() {
            return Err(Error::InvalidArgument("task id cannot be empty".to_string()));
        }
        if let Some(task) = self.store.get(&needle) {
            return Ok(task);
        }
        let mut matches = self
            .store
            .all()
            .into_iter()
            .filter(|task| task.id.starts_with(&needle));
        match (matches.next(), matches.next()) {
            (Some(task), None) => Ok(task),
            (Some(_), Some(_)) => Err(Error::InvalidArgument(format!(
                "task id prefix '{needle}' is ambiguous"
            ))),
            (None, _) => Err(Error::TaskNotFound(raw.trim().to_string())),
        }
    }
}

fn store_path(explicit: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    if let Some(path) = explicit.or_else(|| config.remote.path.clone()) {
        return Ok(path);
    }
    let dirs = ProjectDirs::from("", "", "tasksync").ok_or_else(|| {
        Error::InvalidConfig("no home directory found; pass --store <path>".to_string())
    })?;
    Ok(dirs.data_dir().join("store.json"))
}

fn usage_output(path: &Path, usage: StorageUsage) -> UsageOutput {
    UsageOutput {
        path: path.display().to_string(),
        bytes_in_use: usage.bytes_in_use,
        quota_bytes: usage.quota_bytes,
        remaining: usage.remaining(),
        percent: usage.percent(),
    }
}

fn parse_opt<T: std::str::FromStr<Err = Error>>(raw: Option<&str>) -> Result<Option<T>> {
    raw.map(str::parse).transpose()
}

fn task_line(task: &Task) -> String {
    let mut line = format!(
        "{}  [{}] ({}) {}",
        task.id, task.status, task.priority, task.title
    );
    if let Some(due) = task.due_date {
        line.push_str(&format!("  due {}", due.format("%Y-%m-%d")));
    }
    line
}

fn task_human(header: &str, task: &Task) -> HumanOutput {
    let mut human = HumanOutput::new(header);
    human.push_summary("ID", task.id.clone());
    human.push_summary("Title", task.title.clone());
    human.push_summary("Status", task.status.to_string());
    human.push_summary("Priority", task.priority.to_string());
    human.push_summary("Created", task.created.to_rfc3339());
    if let Some(due) = task.due_date {
        human.push_summary("Due", due.to_rfc3339());
    }
    if let Some(link) = &task.external_link {
        human.push_summary("Link", link.clone());
    }
    if !task.description.is_empty() {
        human.push_detail(task.description.clone());
    }
    human
}

pub async fn run_add(global: GlobalOptions, options: AddOptions) -> Result<()> {
    let mut new = NewTask::new(options.title);
    if let Some(description) = options.description {
        new = new.with_description(description);
    }
    new.priority = parse_opt::<Priority>(options.priority.as_deref())?;
    new.status = parse_opt::<Status>(options.status.as_deref())?;
    new.due_date = options.due.as_deref().map(parse_due_date).transpose()?;
    new.external_link = options.link;

    let ctx = Context::open(&global).await?;
    let task = ctx.store.create(new)?;
    ctx.persist().await?;

    let mut human = task_human("Task created", &task);
    ctx.push_usage_warning(&mut human).await;
    emit_success(ctx.output, "add", &task, Some(&human))
}

pub async fn run_list(global: GlobalOptions, options: ListOptions) -> Result<()> {
    let filter = TaskFilter {
        search: options.search.unwrap_or_default().trim().to_string(),
        priority: parse_opt::<Priority>(options.priority.as_deref())?,
        status: parse_opt::<Status>(options.status.as_deref())?,
    };
    let field: SortField = options.sort.parse()?;
    let direction = if options.asc {
        SortDirection::Asc
    } else {
        SortDirection::Desc
    };

    let ctx = Context::open(&global).await?;
    let tasks = ctx.store.sort(&ctx.store.filter(&filter), field, direction);

    let mut human = if tasks.is_empty() {
        HumanOutput::new("No tasks")
    } else {
        HumanOutput::new(format!("{} task(s)", tasks.len()))
    };
    for task in &tasks {
        human.push_detail(task_line(task));
    }
    let output = ListOutput {
        total: tasks.len(),
        tasks,
    };
    emit_success(ctx.output, "list", &output, Some(&human))
}

pub async fn run_show(global: GlobalOptions, id: String) -> Result<()> {
    let ctx = Context::open(&global).await?;
    let task = ctx.resolve(&id)?;
    let human = task_human("Task", &task);
    emit_success(ctx.output, "show", &task, Some(&human))
}

pub async fn run_edit(global: GlobalOptions, options: EditOptions) -> Result<()> {
    let patch = TaskPatch {
        title: options.title,
        description: options.description,
        priority: parse_opt::<Priority>(options.priority.as_deref())?,
        status: parse_opt::<Status>(options.status.as_deref())?,
        due_date: if options.clear_due {
            Some(None)
        } else {
            options
                .due
                .as_deref()
                .map(parse_due_date)
                .transpose()?
                .map(Some)
        },
        external_link: if options.clear_link {
            Some(None)
        } else {
            options.link.map(Some)
        },
    };
    if patch.is_empty() {
        return Err(Error::InvalidArgument(
            "nothing to change (pass at least one field)".to_string(),
        ));
    }

    let ctx = Context::open(&global).await?;
    let target = ctx.resolve(&options.id)?;
    let task = ctx
        .store
        .update(&target.id, &patch)?
        .ok_or_else(|| Error::TaskNotFound(target.id.clone()))?;
    ctx.persist().await?;

    let mut human = task_human("Task updated", &task);
    ctx.push_usage_warning(&mut human).await;
    emit_success(ctx.output, "edit", &task, Some(&human))
}

pub async fn run_rm(global: GlobalOptions, id: String) -> Result<()> {
    let ctx = Context::open(&global).await?;
    let target = ctx.resolve(&id)?;
    if !ctx.store.delete(&target.id) {
        return Err(Error::TaskNotFound(target.id));
    }
    ctx.persist().await?;

    let mut human = HumanOutput::new("Task deleted");
    human.push_summary("ID", target.id.clone());
    human.push_summary("Title", target.title.clone());
    let output = DeletedOutput {
        id: target.id,
        title: target.title,
    };
    emit_success(ctx.output, "rm", &output, Some(&human))
}

pub async fn run_move(global: GlobalOptions, id: String, status: String) -> Result<()> {
    let status: Status = status.parse()?;
    let ctx = Context::open(&global).await?;
    let target = ctx.resolve(&id)?;
    let task = ctx
        .store
        .update(&target.id, &TaskPatch::status(status))?
        .ok_or_else(|| Error::TaskNotFound(target.id.clone()))?;
    ctx.persist().await?;

    let mut human = HumanOutput::new("Task moved");
    human.push_summary("ID", task.id.clone());
    human.push_summary("From", target.status.to_string());
    human.push_summary("To", task.status.to_string());
    emit_success(ctx.output, "move", &task, Some(&human))
}

pub async fn run_stats(global: GlobalOptions) -> Result<()> {
    let ctx = Context::open(&global).await?;
    let summary = ctx.store.summary(Utc::now());
    let usage = ctx.usage().await;

    let mut human = HumanOutput::new("Task stats");
    human.push_summary("Total", summary.total.to_string());
    for (status, count) in &summary.by_status {
        human.push_summary(status.label(), count.to_string());
    }
    human.push_summary("Overdue", summary.overdue.to_string());
    match &usage {
        Some(usage) => human.push_summary(
            "Storage",
            format!(
                "{} / {} bytes ({}%)",
                usage.bytes_in_use, usage.quota_bytes, usage.percent
            ),
        ),
        None => human.push_warning("storage usage unavailable"),
    }

    let output = StatsOutput { summary, usage };
    emit_success(ctx.output, "stats", &output, Some(&human))
}

pub async fn run_usage(global: GlobalOptions) -> Result<()> {
    let ctx = Context::open(&global).await?;
    let usage = ctx
        .usage()
        .await
        .ok_or_else(|| Error::OperationFailed("storage usage unavailable".to_string()))?;

    let mut human = HumanOutput::new("Storage usage");
    human.push_summary("Store", usage.path.clone());
    human.push_summary("In use", format!("{} bytes", usage.bytes_in_use));
    human.push_summary("Quota", format!("{} bytes", usage.quota_bytes));
    human.push_summary("Remaining", format!("{} bytes", usage.remaining));
    human.push_summary("Full", format!("{}%", usage.percent));
    if usage.percent >= USAGE_WARNING_PERCENT {
        human.push_warning("close to the quota; delete finished tasks to make room");
    }
    emit_success(ctx.output, "usage", &usage, Some(&human))
}

pub async fn run_watch(global: GlobalOptions) -> Result<()> {
    let ctx = Context::open(&global).await?;
    let output = ctx.output;

    print_collection(output, &ctx.store.all())?;

    let _watch = ctx.remote.watch(ctx.config.remote.watch_debounce())?;
    let reconcile = ctx.store.engine().watch_remote();
    let printer: Handler = Arc::new(move |event: &BusEvent| -> anyhow::Result<()> {
        if let BusEvent::Changed(tasks) = event {
            print_collection(output, tasks)?;
        }
        Ok(())
    });
    let subscription = ctx.store.engine().bus().subscribe(Topic::Changed, printer);

    if !output.quiet && !output.json {
        eprintln!(
            "watching {} (Ctrl-C to stop)",
            ctx.remote.path().display()
        );
    }
    tokio::signal::ctrl_c().await?;

    subscription.unsubscribe();
    reconcile.abort();
    ctx.persist().await
}

fn print_collection(output: OutputOptions, tasks: &[Task]) -> Result<()> {
    let mut human = HumanOutput::new(format!("{} task(s)", tasks.len()));
    for task in tasks {
        human.push_detail(task_line(task));
    }
    let data = ListOutput {
        total: tasks.len(),
        tasks: tasks.to_vec(),
    };
    emit_success(output, "watch", &data, Some(&human))
}
