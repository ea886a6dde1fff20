//! Command persistence
//!
//! [`CommandRepository`] is the storage contract used by the command service.
//! [`InMemoryCommandRepository`] keeps rows in creation order, with inputs and
//! outputs stored as type discriminant plus JSON bytes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use raybot_shared::{
    state_machine, Command, CommandId, CommandSource, CommandStatus, Inputs, Outputs,
    StoredPayload,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use crate::error::CommandError;

/// Columns accepted by [`ListCommandsParams::sorts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Type,
    Status,
    Source,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: SortField,
    pub descending: bool,
}

impl FromStr for Sort {
    type Err = raybot_shared::ValidationError;

    /// `created_at` sorts ascending, `-created_at` descending
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (descending, name) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let field = match name {
            "type" => SortField::Type,
            "status" => SortField::Status,
            "source" => SortField::Source,
            "created_at" => SortField::CreatedAt,
            "updated_at" => SortField::UpdatedAt,
            "completed_at" => SortField::CompletedAt,
            other => {
                return Err(raybot_shared::ValidationError::new(
                    "sorts",
                    format!("unsupported sort column {other}"),
                ))
            }
        };
        Ok(Sort { field, descending })
    }
}

/// Filter, sort and paging for [`CommandRepository::list_commands`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCommandsParams {
    /// 1-based
    pub page: u32,
    pub page_size: u32,
    /// Empty means every status
    pub statuses: Vec<CommandStatus>,
    /// Applied in order; ties fall back to creation order
    pub sorts: Vec<Sort>,
}

impl Default for ListCommandsParams {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 10,
            statuses: Vec::new(),
            sorts: vec![Sort {
                field: SortField::CreatedAt,
                descending: true,
            }],
        }
    }
}

/// One page of a listing plus the unpaged total
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_items: usize,
}

/// Partial update; `None` leaves a column untouched
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCommandParams {
    pub id: CommandId,
    pub status: Option<CommandStatus>,
    pub outputs: Option<Outputs>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UpdateCommandParams {
    /// Update touching only `updated_at`
    pub fn new(id: CommandId, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: None,
            outputs: None,
            error: None,
            started_at: None,
            completed_at: None,
            updated_at,
        }
    }

    /// Move to `status`; rejected unless the transition is allowed
    pub fn status(mut self, status: CommandStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Record executor outputs
    pub fn outputs(mut self, outputs: Outputs) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Record the failure message
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set the execution start time
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Set the completion time
    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

#[async_trait]
pub trait CommandRepository: Send + Sync {
    /// One page of commands, filtered by status and sorted
    async fn list_commands(&self, params: &ListCommandsParams)
        -> Result<Page<Command>, CommandError>;

    /// Atomically move the oldest QUEUED command to PROCESSING
    async fn claim_next_executable_command(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Command, CommandError>;

    /// The command in PROCESSING or CANCELING
    async fn get_current_processing_command(&self) -> Result<Command, CommandError>;

    /// `NotFound` when no row has `id`
    async fn get_command_by_id(&self, id: CommandId) -> Result<Command, CommandError>;

    /// Insert and assign an ID; a duplicate request ID fails with `AlreadyExists`
    async fn create_command(&self, command: Command) -> Result<Command, CommandError>;

    /// Apply `params`; a status change must follow the state machine
    async fn update_command(&self, params: UpdateCommandParams) -> Result<Command, CommandError>;

    /// Cancel every QUEUED, PROCESSING and CANCELING command (startup recovery)
    async fn cancel_pending_commands(&self, now: DateTime<Utc>)
        -> Result<Vec<CommandId>, CommandError>;

    /// Cancel QUEUED commands, optionally only those from `source`
    async fn cancel_queued_commands(
        &self,
        source: Option<CommandSource>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CommandId>, CommandError>;

    /// Refuses PROCESSING and CANCELING commands
    async fn delete_command_by_id(&self, id: CommandId) -> Result<(), CommandError>;

    /// Delete finished commands created before `cutoff`
    async fn delete_old_commands(&self, cutoff: DateTime<Utc>) -> Result<u64, CommandError>;
}

#[derive(Debug, Clone)]
struct Row {
    id: CommandId,
    status: CommandStatus,
    source: CommandSource,
    inputs: StoredPayload,
    outputs: Option<StoredPayload>,
    error: Option<String>,
    request_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Row {
    fn to_command(&self) -> Result<Command, CommandError> {
        Ok(Command {
            id: self.id,
            status: self.status,
            source: self.source,
            inputs: Inputs::from_stored(&self.inputs)?,
            outputs: self
                .outputs
                .as_ref()
                .map(Outputs::from_stored)
                .transpose()?,
            error: self.error.clone(),
            request_id: self.request_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }

    fn transition(&mut self, to: CommandStatus, now: DateTime<Utc>) -> Result<(), CommandError> {
        if !state_machine::is_valid_transition(self.status, to) {
            return Err(CommandError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    fn compare(&self, other: &Row, sort: &Sort) -> Ordering {
        let ord = match sort.field {
            SortField::Type => self.inputs.kind.as_str().cmp(other.inputs.kind.as_str()),
            SortField::Status => self.status.as_str().cmp(other.status.as_str()),
            SortField::Source => self.source.to_string().cmp(&other.source.to_string()),
            SortField::CreatedAt => self.created_at.cmp(&other.created_at),
            SortField::UpdatedAt => self.updated_at.cmp(&other.updated_at),
            SortField::CompletedAt => self.completed_at.cmp(&other.completed_at),
        };
        if sort.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

#[derive(Default)]
struct Table {
    last_id: CommandId,
    rows: BTreeMap<CommandId, Row>,
}

/// Command table kept in process memory
#[derive(Default)]
pub struct InMemoryCommandRepository {
    table: Mutex<Table>,
}

impl InMemoryCommandRepository {
    /// Empty table; IDs start at 1
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CommandRepository for InMemoryCommandRepository {
    async fn list_commands(
        &self,
        params: &ListCommandsParams,
    ) -> Result<Page<Command>, CommandError> {
        let table = self.lock();
        let mut rows: Vec<&Row> = table
            .rows
            .values()
            .filter(|r| params.statuses.is_empty() || params.statuses.contains(&r.status))
            .collect();
        rows.sort_by(|a, b| {
            params
                .sorts
                .iter()
                .map(|s| a.compare(b, s))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.id.cmp(&b.id))
        });

        let total_items = rows.len();
        let page_size = params.page_size.max(1) as usize;
        let offset = (params.page.max(1) as usize - 1) * page_size;
        let items = rows
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(Row::to_command)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, total_items })
    }

    async fn claim_next_executable_command(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Command, CommandError> {
        let mut table = self.lock();
        let row = table
            .rows
            .values_mut()
            .find(|r| r.status == CommandStatus::Queued)
            .ok_or(CommandError::NoNextExecutableCommand)?;
        row.transition(CommandStatus::Processing, now)?;
        row.started_at = Some(now);
        row.to_command()
    }

    async fn get_current_processing_command(&self) -> Result<Command, CommandError> {
        let table = self.lock();
        table
            .rows
            .values()
            .find(|r| r.status.is_in_progress())
            .ok_or(CommandError::NoCommandBeingProcessed)?
            .to_command()
    }

    async fn get_command_by_id(&self, id: CommandId) -> Result<Command, CommandError> {
        let table = self.lock();
        table
            .rows
            .get(&id)
            .ok_or(CommandError::NotFound(id))?
            .to_command()
    }

    async fn create_command(&self, command: Command) -> Result<Command, CommandError> {
        let inputs = command.inputs.to_stored()?;
        let outputs = command.outputs.as_ref().map(Outputs::to_stored).transpose()?;

        let mut table = self.lock();
        if let Some(request_id) = &command.request_id {
            if table
                .rows
                .values()
                .any(|r| r.request_id.as_deref() == Some(request_id.as_str()))
            {
                return Err(CommandError::AlreadyExists(request_id.clone()));
            }
        }

        table.last_id += 1;
        let row = Row {
            id: table.last_id,
            status: command.status,
            source: command.source,
            inputs,
            outputs,
            error: command.error,
            request_id: command.request_id,
            created_at: command.created_at,
            updated_at: command.updated_at,
            started_at: command.started_at,
            completed_at: command.completed_at,
        };
        let created = row.to_command()?;
        table.rows.insert(row.id, row);
        Ok(created)
    }

    async fn update_command(&self, params: UpdateCommandParams) -> Result<Command, CommandError> {
        let outputs = params.outputs.as_ref().map(Outputs::to_stored).transpose()?;

        let mut table = self.lock();
        let row = table
            .rows
            .get_mut(&params.id)
            .ok_or(CommandError::NotFound(params.id))?;

        if let Some(status) = params.status {
            row.transition(status, params.updated_at)?;
        }
        if let Some(outputs) = outputs {
            row.outputs = Some(outputs);
        }
        if let Some(error) = params.error {
            row.error = Some(error);
        }
        if let Some(at) = params.started_at {
            row.started_at = Some(at);
        }
        if let Some(at) = params.completed_at {
            row.completed_at = Some(at);
        }
        row.updated_at = params.updated_at;
        row.to_command()
    }

    async fn cancel_pending_commands(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CommandId>, CommandError> {
        let mut table = self.lock();
        let mut cancelled = Vec::new();
        for row in table.rows.values_mut() {
            if row.status == CommandStatus::Processing {
                row.transition(CommandStatus::Canceling, now)?;
            }
            if matches!(row.status, CommandStatus::Queued | CommandStatus::Canceling) {
                row.transition(CommandStatus::Canceled, now)?;
                cancelled.push(row.id);
            }
        }
        Ok(cancelled)
    }

    async fn cancel_queued_commands(
        &self,
        source: Option<CommandSource>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CommandId>, CommandError> {
        let mut table = self.lock();
        let mut cancelled = Vec::new();
        for row in table.rows.values_mut() {
            let source_matches = source.map_or(true, |s| s == row.source);
            if row.status == CommandStatus::Queued && source_matches {
                row.transition(CommandStatus::Canceled, now)?;
                cancelled.push(row.id);
            }
        }
        Ok(cancelled)
    }

    async fn delete_command_by_id(&self, id: CommandId) -> Result<(), CommandError> {
        let mut table = self.lock();
        let row = table.rows.get(&id).ok_or(CommandError::NotFound(id))?;
        if row.status.is_in_progress() {
            return Err(CommandError::InProcessingCanNotBeDeleted(id));
        }
        table.rows.remove(&id);
        Ok(())
    }

    async fn delete_old_commands(&self, cutoff: DateTime<Utc>) -> Result<u64, CommandError> {
        let mut table = self.lock();
        let before = table.rows.len();
        table
            .rows
            .retain(|_, r| !(r.status.is_terminal() && r.created_at < cutoff));
        Ok((before - table.rows.len()) as u64)
    }
}
