//! Receive-pack session (push).
//!
//! The client sends ref update commands, optionally push options, then a
//! pack holding the new objects. Each command is checked against the ref's
//! current value, the survivors are applied as one compare-and-swap batch,
//! and a report lists the outcome of every command in submission order.

use crate::advertise::{advertise, Advertisement};
use crate::cancel::{self, CancellableReader};
use crate::capabilities::{Capabilities, ATOMIC, PUSH_OPTIONS, REPORT_STATUS};
use crate::closure;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::sideband::{write_band, Band, SidebandMode};
use crate::{CommandError, GitError, Result, ServiceKind, SessionConfig};
use gitway_storage::{HashAlgorithm, ObjectId, PackCodec, RefUpdate, RefUpdateError, Repository};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Phases of a receive-pack session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// Reading command lines and the optional push-options section.
    AwaitCommands,
    /// Ingesting the pack that follows the commands.
    AwaitPackData,
    /// Checking every command against current ref values and the object store.
    Validating,
    /// Committing the surviving commands as one batch.
    Applying,
    /// Writing the report, if the client asked for one.
    ReportGeneration,
    /// Session over.
    Done,
}

/// One `<old> <new> <ref>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdateCommand {
    /// Full ref name.
    pub name: String,
    /// Expected current value, null to create.
    pub old: ObjectId,
    /// New value, null to delete.
    pub new: ObjectId,
}

impl RefUpdateCommand {
    /// Parses a command line (capabilities already split off).
    pub fn parse(line: &str, algorithm: HashAlgorithm) -> Result<Self> {
        let invalid = || GitError::Protocol(format!("invalid command: {}", line));
        let mut parts = line.splitn(3, ' ');
        let (old, new, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(old), Some(new), Some(name)) if !name.is_empty() => (old, new, name),
            _ => return Err(invalid()),
        };
        let old = ObjectId::from_hex(old).map_err(|_| invalid())?;
        let new = ObjectId::from_hex(new).map_err(|_| invalid())?;
        if old.algorithm() != algorithm || new.algorithm() != algorithm {
            return Err(GitError::Protocol(format!(
                "command ids are not {}: {}",
                algorithm, line
            )));
        }
        Ok(Self {
            name: name.to_string(),
            old,
            new,
        })
    }

    /// True when the ref must not exist yet.
    pub fn is_create(&self) -> bool {
        self.old.is_null()
    }

    /// True when the ref is removed.
    pub fn is_delete(&self) -> bool {
        self.new.is_null()
    }
}

/// Loose `git check-ref-format`: names must live under `refs/`.
pub fn check_ref_name(name: &str) -> bool {
    if !name.starts_with("refs/") || name.ends_with('/') || name.ends_with('.') {
        return false;
    }
    if name.contains("..") || name.contains("@{") {
        return false;
    }
    if name
        .chars()
        .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return false;
    }
    name.split('/')
        .all(|part| !part.is_empty() && !part.starts_with('.') && !part.ends_with(".lock"))
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Ref the command targeted.
    pub name: String,
    /// `Ok` if the update was applied.
    pub result: std::result::Result<(), CommandError>,
}

/// The report sent back after a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportStatus {
    /// `Err(reason)` when the pack could not be ingested.
    pub unpack: std::result::Result<(), String>,
    /// One entry per command, in submission order.
    pub commands: Vec<CommandStatus>,
}

impl ReportStatus {
    /// True iff the pack unpacked and no command failed.
    pub fn is_ok(&self) -> bool {
        self.unpack.is_ok() && self.commands.iter().all(|c| c.result.is_ok())
    }

    /// Report lines without trailing newlines.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.commands.len() + 1);
        lines.push(match &self.unpack {
            Ok(()) => "unpack ok".to_string(),
            Err(reason) => format!("unpack {}", reason),
        });
        for cmd in &self.commands {
            lines.push(match &cmd.result {
                Ok(()) => format!("ok {}", cmd.name),
                Err(e) => format!("ng {} {}", cmd.name, e),
            });
        }
        lines
    }
}

/// What a finished receive-pack session did.
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    /// Capabilities negotiated on the first command.
    pub capabilities: Capabilities,
    /// Commands in submission order.
    pub commands: Vec<RefUpdateCommand>,
    /// Strings from the `push-options` section, in order.
    pub push_options: Vec<String>,
    /// Objects stored from the pushed pack.
    pub ingested: Vec<ObjectId>,
    /// Per-command results, as reported.
    pub report: ReportStatus,
}

/// Mutable state of one push.
struct Push {
    capabilities: Capabilities,
    commands: Vec<RefUpdateCommand>,
    push_options: Vec<String>,
    ingested: Vec<ObjectId>,
    results: Vec<Option<CommandError>>,
    unpack: std::result::Result<(), String>,
    /// Session error raised after the report went out.
    fatal: Option<GitError>,
}

impl Push {
    fn new() -> Self {
        Self {
            capabilities: Capabilities::new(),
            commands: Vec::new(),
            push_options: Vec::new(),
            ingested: Vec::new(),
            results: Vec::new(),
            unpack: Ok(()),
            fatal: None,
        }
    }

    fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(i, _)| i)
    }

    fn report(&self) -> ReportStatus {
        ReportStatus {
            unpack: self.unpack.clone(),
            commands: self
                .commands
                .iter()
                .zip(&self.results)
                .map(|(cmd, result)| CommandStatus {
                    name: cmd.name.clone(),
                    result: match result {
                        Some(e) => Err(e.clone()),
                        None => Ok(()),
                    },
                })
                .collect(),
        }
    }
}

fn map_ref_error(err: RefUpdateError) -> CommandError {
    match err {
        RefUpdateError::Stale { .. } => CommandError::StaleRef,
        RefUpdateError::Locked => CommandError::Backend(err.to_string()),
        RefUpdateError::Aborted => CommandError::AtomicAborted,
    }
}

/// Serves one receive-pack request.
pub struct ReceivePackSession {
    repo: Arc<dyn Repository>,
    codec: Arc<dyn PackCodec>,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl ReceivePackSession {
    /// Creates a session over an already resolved repository.
    pub fn new(repo: Arc<dyn Repository>, codec: Arc<dyn PackCodec>, config: SessionConfig) -> Self {
        Self {
            repo,
            codec,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Aborts the session when `token` fires. Refs are never touched after that.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Protocol knobs of this session.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Writes the ref advertisement only.
    pub fn advertise<W: Write>(&self, output: W) -> Result<Advertisement> {
        advertise(
            &mut PktLineWriter::new(output),
            &*self.repo,
            ServiceKind::ReceivePack,
            &self.config,
        )
    }

    /// Runs the session to completion.
    ///
    /// `input` must not have been read past the advertisement: the pack
    /// follows the command list on the same stream with no framing.
    pub fn run<R: BufRead, W: Write>(&self, mut input: R, output: W) -> Result<ReceiveOutcome> {
        let mut writer = PktLineWriter::new(output);
        let advertisement = if self.config.stateless_rpc {
            Advertisement::build(&*self.repo, ServiceKind::ReceivePack, &self.config)?
        } else {
            advertise(&mut writer, &*self.repo, ServiceKind::ReceivePack, &self.config)?
        };

        let mut push = Push::new();
        let mut state = ReceiveState::AwaitCommands;
        while state != ReceiveState::Done {
            if matches!(
                state,
                ReceiveState::AwaitCommands
                    | ReceiveState::AwaitPackData
                    | ReceiveState::Validating
                    | ReceiveState::Applying
            ) {
                cancel::check(&self.cancel)?;
            }
            let next = match state {
                ReceiveState::AwaitCommands => {
                    self.read_commands(&mut input, &advertisement, &mut push)?
                }
                ReceiveState::AwaitPackData => self.read_pack(&mut input, &mut push)?,
                ReceiveState::Validating => self.validate(&mut push)?,
                ReceiveState::Applying => self.apply(&mut push),
                ReceiveState::ReportGeneration => {
                    self.send_report(&mut writer, &push)?;
                    ReceiveState::Done
                }
                ReceiveState::Done => ReceiveState::Done,
            };
            tracing::debug!(from = ?state, to = ?next, "receive-pack transition");
            state = next;
        }

        let report = push.report();
        if let Some(err) = push.fatal.take() {
            tracing::error!(error = %err, "receive-pack failed after reporting");
            return Err(err);
        }
        tracing::info!(
            commands = push.commands.len(),
            ok = report.is_ok(),
            objects = push.ingested.len(),
            "receive-pack finished"
        );
        Ok(ReceiveOutcome {
            capabilities: push.capabilities,
            commands: push.commands,
            push_options: push.push_options,
            ingested: push.ingested,
            report,
        })
    }

    fn read_commands<R: BufRead>(
        &self,
        input: &mut R,
        advertisement: &Advertisement,
        push: &mut Push,
    ) -> Result<ReceiveState> {
        let algorithm = self.repo.hash_algorithm();
        let mut reader = PktLineReader::new(&mut *input);
        loop {
            match reader.read()? {
                None if push.commands.is_empty() => return Ok(ReceiveState::Done),
                None => {
                    return Err(GitError::Protocol(
                        "unexpected end of stream in command list".to_string(),
                    ))
                }
                Some(PktLine::Flush) => break,
                Some(PktLine::Data(data)) => {
                    let (line, caps) = match data.iter().position(|&b| b == 0) {
                        Some(nul) => (&data[..nul], Some(&data[nul + 1..])),
                        None => (&data[..], None),
                    };
                    let line = std::str::from_utf8(line)
                        .map_err(|_| GitError::Protocol("non-utf8 command".to_string()))?
                        .trim_end_matches('\n');
                    if push.commands.is_empty() {
                        let requested = Capabilities::parse(&String::from_utf8_lossy(
                            caps.unwrap_or_default(),
                        ));
                        push.capabilities = advertisement.capabilities.negotiate(&requested)?;
                    }
                    push.commands.push(RefUpdateCommand::parse(line, algorithm)?);
                }
                Some(other) => {
                    return Err(GitError::Protocol(format!(
                        "unexpected {:?} in command list",
                        other
                    )))
                }
            }
        }

        if push.commands.is_empty() {
            return Ok(ReceiveState::ReportGeneration);
        }
        tracing::debug!(
            commands = push.commands.len(),
            capabilities = %push.capabilities,
            "received commands"
        );

        if push.capabilities.contains(PUSH_OPTIONS) {
            loop {
                match reader.read_required()? {
                    PktLine::Flush => break,
                    PktLine::Data(data) => push
                        .push_options
                        .push(String::from_utf8_lossy(&data).trim_end_matches('\n').to_string()),
                    other => {
                        return Err(GitError::Protocol(format!(
                            "unexpected {:?} in push options",
                            other
                        )))
                    }
                }
            }
        }

        push.results = vec![None; push.commands.len()];
        if push.commands.iter().all(RefUpdateCommand::is_delete) {
            Ok(ReceiveState::Validating)
        } else {
            Ok(ReceiveState::AwaitPackData)
        }
    }

    fn read_pack<R: BufRead>(&self, input: &mut R, push: &mut Push) -> Result<ReceiveState> {
        let mut guarded = CancellableReader::new(input, &self.cancel);
        match self.codec.ingest_pack(&*self.repo, &mut guarded) {
            Ok(ids) => {
                tracing::debug!(objects = ids.len(), "pack ingested");
                push.ingested = ids;
                Ok(ReceiveState::Validating)
            }
            Err(_) if self.cancel.is_cancelled() => Err(GitError::Cancelled),
            Err(e) => match GitError::from(e) {
                GitError::CorruptPack(reason) => {
                    tracing::warn!(reason = %reason, "rejecting corrupt pack");
                    push.unpack = Err(reason.clone());
                    push.results = vec![Some(CommandError::UnpackerError); push.commands.len()];
                    push.fatal = Some(GitError::CorruptPack(reason));
                    Ok(ReceiveState::ReportGeneration)
                }
                other => Err(other),
            },
        }
    }

    fn validate(&self, push: &mut Push) -> Result<ReceiveState> {
        for i in 0..push.commands.len() {
            if push.results[i].is_none() {
                push.results[i] = self.check_command(&push.commands[i])?;
            }
        }

        let failed = push.results.iter().filter(|r| r.is_some()).count();
        if failed > 0 && push.capabilities.contains(ATOMIC) {
            tracing::warn!(failed, "atomic push rejected");
            for result in push.results.iter_mut().filter(|r| r.is_none()) {
                *result = Some(CommandError::AtomicAborted);
            }
            return Ok(ReceiveState::ReportGeneration);
        }
        if failed == push.commands.len() {
            Ok(ReceiveState::ReportGeneration)
        } else {
            Ok(ReceiveState::Applying)
        }
    }

    fn check_command(&self, cmd: &RefUpdateCommand) -> Result<Option<CommandError>> {
        if !check_ref_name(&cmd.name) {
            return Ok(Some(CommandError::InvalidRefName));
        }
        if cmd.is_delete() && !self.config.allow_deletes {
            return Ok(Some(CommandError::DeletionDenied));
        }

        let current = self.repo.read_ref(&cmd.name)?;
        let expected = if cmd.is_create() { None } else { Some(cmd.old) };
        if current != expected {
            tracing::warn!(
                refname = %cmd.name,
                expected = %cmd.old,
                "stale ref in push"
            );
            return Ok(Some(CommandError::StaleRef));
        }

        if !cmd.is_delete() && !self.repo.has_object(&cmd.new)? {
            return Ok(Some(CommandError::MissingObject));
        }

        if self.config.deny_non_fast_forwards
            && !cmd.is_create()
            && !cmd.is_delete()
            && !closure::is_ancestor(&*self.repo, &cmd.old, &cmd.new)?
        {
            return Ok(Some(CommandError::NonFastForward));
        }
        Ok(None)
    }

    fn apply(&self, push: &mut Push) -> ReceiveState {
        let indices: Vec<usize> = push.pending().collect();
        let updates: Vec<RefUpdate> = indices
            .iter()
            .map(|&i| {
                let cmd = &push.commands[i];
                RefUpdate::new(cmd.name.clone(), cmd.old, cmd.new)
            })
            .collect();
        let atomic = push.capabilities.contains(ATOMIC);

        match self.repo.apply_updates(&updates, atomic) {
            Ok(results) => {
                let mut results = results.into_iter();
                for &i in &indices {
                    push.results[i] = match results.next() {
                        Some(Ok(())) => None,
                        Some(Err(e)) => Some(map_ref_error(e)),
                        None => Some(CommandError::Backend("no result from backend".to_string())),
                    };
                }
            }
            Err(e) => {
                let msg = e.to_string();
                tracing::error!(error = %msg, "ref update failed");
                for &i in &indices {
                    push.results[i] = Some(CommandError::Backend(msg.clone()));
                }
                push.fatal = Some(GitError::Backend(msg));
            }
        }
        ReceiveState::ReportGeneration
    }

    fn send_report<W: Write>(&self, writer: &mut PktLineWriter<W>, push: &Push) -> Result<()> {
        let report = push.report();
        for cmd in &report.commands {
            match &cmd.result {
                Ok(()) => tracing::info!(refname = %cmd.name, "ref updated"),
                Err(e) => tracing::info!(refname = %cmd.name, reason = %e, "ref rejected"),
            }
        }
        if push.commands.is_empty() || !push.capabilities.contains(REPORT_STATUS) {
            return Ok(());
        }

        let mode = SidebandMode::from_capabilities(&push.capabilities);
        if mode.is_enabled() {
            let mut inner = PktLineWriter::new(Vec::<u8>::new());
            for line in report.lines() {
                inner.write_line(&line)?;
            }
            inner.flush_pkt()?;
            write_band(writer.get_mut(), mode, Band::Data, &inner.into_inner())?;
        } else {
            for line in report.lines() {
                writer.write_line(&line)?;
            }
        }
        writer.flush_pkt()?;
        writer.flush()
    }
}
