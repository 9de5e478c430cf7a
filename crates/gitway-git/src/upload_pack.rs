//! Upload-pack session (fetch and clone).
//!
//! After the advertisement the client names the objects it wants, then
//! lists objects it already has in rounds separated by flushes. The server
//! acknowledges common objects, and once the client says `done` (or, with
//! `no-done`, once the server is ready) it sends one pack holding
//! everything reachable from the wants that is not reachable from the
//! common haves. Without `multi_ack` nothing is acknowledged before `done`,
//! and a client whose haves already cover every want gets a lone `NAK`.
//!
//! The negotiation is an explicit state machine: [`Negotiation::transition`]
//! takes the current [`UploadState`] and one frame and returns the next
//! state plus the lines to send back. [`UploadPackSession`] only drives I/O.

use crate::advertise::{advertise, Advertisement};
use crate::cancel::{self, CancellableWriter};
use crate::capabilities::{Capabilities, MULTI_ACK, MULTI_ACK_DETAILED, NO_DONE, NO_PROGRESS};
use crate::closure;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::sideband::{write_band, Band, SidebandMode, SidebandWriter};
use crate::{GitError, Result, ServiceKind, SessionConfig};
use gitway_storage::{ObjectId, PackCodec, Repository};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Phases of an upload-pack session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Reading `want` lines.
    AwaitWants,
    /// Inside a round of `have` lines.
    AwaitHaves,
    /// A round ended with a flush and was answered; more haves or `done` may follow.
    Negotiating,
    /// Negotiation finished, the pack goes out next.
    PackGeneration,
    /// Session over, nothing more is read or written.
    Done,
}

/// How common objects are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// No acknowledgment until `done`, then one `ACK <id>`.
    #[default]
    Single,
    /// `multi_ack`: `ACK <id> continue` for every common object.
    Multi,
    /// `multi_ack_detailed`: `ACK <id> common` and `ACK <id> ready`.
    Detailed,
}

/// Outcome of feeding one frame to the negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State to continue from.
    pub next: UploadState,
    /// Lines to send, without trailing newlines.
    pub replies: Vec<String>,
}

impl Transition {
    fn to(next: UploadState) -> Self {
        Self {
            next,
            replies: Vec::new(),
        }
    }

    fn reply(next: UploadState, replies: Vec<String>) -> Self {
        Self { next, replies }
    }
}

/// Want/have negotiation state.
pub struct Negotiation<'a> {
    repo: &'a dyn Repository,
    config: &'a SessionConfig,
    offered: &'a Capabilities,
    tips: HashSet<ObjectId>,
    capabilities: Capabilities,
    ack_mode: AckMode,
    no_done: bool,
    wants: Vec<ObjectId>,
    common: Vec<ObjectId>,
    common_set: HashSet<ObjectId>,
    satisfied: HashSet<ObjectId>,
    last_common: Option<ObjectId>,
    got_common: bool,
    got_other: bool,
    sent_ready: bool,
}

impl<'a> Negotiation<'a> {
    /// Starts a negotiation against what `advertisement` offered.
    pub fn new(
        repo: &'a dyn Repository,
        config: &'a SessionConfig,
        advertisement: &'a Advertisement,
    ) -> Self {
        Self {
            repo,
            config,
            offered: &advertisement.capabilities,
            tips: advertisement.tips(),
            capabilities: Capabilities::new(),
            ack_mode: AckMode::Single,
            no_done: false,
            wants: Vec::new(),
            common: Vec::new(),
            common_set: HashSet::new(),
            satisfied: HashSet::new(),
            last_common: None,
            got_common: false,
            got_other: false,
            sent_ready: false,
        }
    }

    /// Capabilities the client asked for on its first want, intersected with the offer.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Acknowledgment style picked from the client's capabilities.
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Accepted wants, deduplicated, in the order received.
    pub fn wants(&self) -> &[ObjectId] {
        &self.wants
    }

    /// Haves the repository holds, in the order the client sent them.
    pub fn common(&self) -> &[ObjectId] {
        &self.common
    }

    /// Feeds one frame, `None` meaning the client closed its side.
    pub fn transition(&mut self, state: UploadState, frame: Option<PktLine>) -> Result<Transition> {
        use UploadState::*;

        let line = match &frame {
            Some(PktLine::Data(_)) => Some(
                frame
                    .as_ref()
                    .and_then(PktLine::as_str)
                    .ok_or_else(|| GitError::Protocol("non-utf8 negotiation line".to_string()))?
                    .to_string(),
            ),
            _ => None,
        };

        match (state, frame, line) {
            (PackGeneration | Done, _, _) => Err(GitError::Protocol(
                "negotiation already finished".to_string(),
            )),
            (_, Some(PktLine::Delimiter | PktLine::ResponseEnd), _) => Err(GitError::Protocol(
                "unexpected special packet during negotiation".to_string(),
            )),

            (AwaitWants, Some(PktLine::Data(_)), Some(line)) => {
                if let Some(rest) = line.strip_prefix("want ") {
                    self.add_want(rest)?;
                    Ok(Transition::to(AwaitWants))
                } else if line == "done" && !self.wants.is_empty() {
                    Ok(Transition::reply(PackGeneration, vec!["NAK".to_string()]))
                } else {
                    Err(unexpected(&line, state))
                }
            }
            (AwaitWants, Some(PktLine::Flush), _) | (AwaitWants, None, _) if self.wants.is_empty() => {
                Ok(Transition::to(Done))
            }
            (AwaitWants, Some(PktLine::Flush), _) => Ok(Transition::to(AwaitHaves)),

            (AwaitHaves | Negotiating, Some(PktLine::Data(_)), Some(line)) => {
                if let Some(hex) = line.strip_prefix("have ") {
                    let id = self.parse_id(hex.trim())?;
                    let replies = self.add_have(id)?;
                    Ok(Transition::reply(AwaitHaves, replies))
                } else if line == "done" {
                    let (replies, next) = self.finish()?;
                    Ok(Transition::reply(next, replies))
                } else {
                    Err(unexpected(&line, state))
                }
            }
            (AwaitHaves | Negotiating, Some(PktLine::Flush), _) => {
                let (replies, end) = self.end_round()?;
                let next = match end {
                    RoundEnd::Ready => PackGeneration,
                    RoundEnd::Satisfied => Done,
                    RoundEnd::Continue if self.config.stateless_rpc => Done,
                    RoundEnd::Continue => Negotiating,
                };
                Ok(Transition::reply(next, replies))
            }
            (Negotiating, None, _) => Ok(Transition::to(Done)),
            (AwaitWants | AwaitHaves, None, _) => Err(GitError::Protocol(
                "unexpected end of stream during negotiation".to_string(),
            )),
            (_, Some(PktLine::Data(_)), None) => Err(GitError::Protocol(
                "non-utf8 negotiation line".to_string(),
            )),
        }
    }

    fn parse_id(&self, hex: &str) -> Result<ObjectId> {
        let id = ObjectId::from_hex(hex)
            .map_err(|_| GitError::Protocol(format!("invalid object id: {}", hex)))?;
        if id.algorithm() != self.repo.hash_algorithm() {
            return Err(GitError::Protocol(format!(
                "object id {} is not {}",
                hex,
                self.repo.hash_algorithm()
            )));
        }
        Ok(id)
    }

    fn add_want(&mut self, rest: &str) -> Result<()> {
        let (hex, caps) = rest.split_once(' ').unwrap_or((rest, ""));
        let id = self.parse_id(hex)?;

        if self.wants.is_empty() && self.capabilities.is_empty() {
            self.capabilities = self.offered.negotiate(&Capabilities::parse(caps))?;
            self.ack_mode = if self.capabilities.contains(MULTI_ACK_DETAILED) {
                AckMode::Detailed
            } else if self.capabilities.contains(MULTI_ACK) {
                AckMode::Multi
            } else {
                AckMode::Single
            };
            self.no_done = self.ack_mode == AckMode::Detailed && self.capabilities.contains(NO_DONE);
        }

        if self.config.strict_wants {
            let allowed = self.tips.contains(&id)
                || (self.config.allow_reachable_sha1_in_want && {
                    let tips: Vec<ObjectId> = self.tips.iter().copied().collect();
                    closure::is_reachable_from(self.repo, &id, &tips)?
                });
            if !allowed {
                tracing::warn!(want = %id, "rejecting want that was not advertised");
                return Err(GitError::UnknownWant(id));
            }
        } else if !self.repo.has_object(&id)? {
            tracing::warn!(want = %id, "ignoring want for unknown object");
            return Ok(());
        }

        if !self.wants.contains(&id) {
            self.wants.push(id);
        }
        Ok(())
    }

    fn add_have(&mut self, id: ObjectId) -> Result<Vec<String>> {
        let mut replies = Vec::new();
        if self.repo.has_object(&id)? {
            self.got_common = true;
            if self.common_set.insert(id) {
                self.common.push(id);
            }
            self.last_common = Some(id);
            match self.ack_mode {
                AckMode::Detailed => replies.push(format!("ACK {} common", id)),
                AckMode::Multi => replies.push(format!("ACK {} continue", id)),
                AckMode::Single => {}
            }
        } else {
            self.got_other = true;
            if self.ack_mode != AckMode::Single && self.ok_to_give_up()? {
                if self.ack_mode == AckMode::Detailed {
                    self.sent_ready = true;
                    replies.push(format!("ACK {} ready", id));
                } else {
                    replies.push(format!("ACK {} continue", id));
                }
            }
        }
        Ok(replies)
    }

    /// Answers the flush that closes a round.
    fn end_round(&mut self) -> Result<(Vec<String>, RoundEnd)> {
        if self.ack_mode == AckMode::Single {
            self.got_common = false;
            self.got_other = false;
            if self.wants_covered()? {
                tracing::debug!("client already has every wanted object");
                return Ok((vec!["NAK".to_string()], RoundEnd::Satisfied));
            }
            return Ok((vec!["NAK".to_string()], RoundEnd::Continue));
        }

        let mut replies = Vec::new();
        if let Some(last) = self.last_common {
            if self.ack_mode == AckMode::Detailed
                && self.got_common
                && !self.got_other
                && self.ok_to_give_up()?
            {
                self.sent_ready = true;
                replies.push(format!("ACK {} ready", last));
            }
        }
        replies.push("NAK".to_string());
        self.got_common = false;
        self.got_other = false;

        if self.no_done && self.sent_ready {
            if let Some(last) = self.last_common {
                replies.push(format!("ACK {}", last));
            }
            return Ok((replies, RoundEnd::Ready));
        }
        Ok((replies, RoundEnd::Continue))
    }

    /// Answers `done`: the final acknowledgment and where the session goes next.
    fn finish(&mut self) -> Result<(Vec<String>, UploadState)> {
        if self.ack_mode == AckMode::Single && self.wants_covered()? {
            return Ok((vec!["NAK".to_string()], UploadState::Done));
        }
        let reply = match self.last_common {
            Some(last) => format!("ACK {}", last),
            None => "NAK".to_string(),
        };
        Ok((vec![reply], UploadState::PackGeneration))
    }

    /// True when every want is reachable from the common haves, so the pack
    /// would be empty.
    fn wants_covered(&self) -> Result<bool> {
        if self.common.is_empty() {
            return Ok(false);
        }
        let have_closure: HashSet<ObjectId> =
            closure::reachable(self.repo, &self.common, &HashSet::new())?
                .into_iter()
                .collect();
        Ok(self.wants.iter().all(|want| have_closure.contains(want)))
    }

    /// True once every want has a common object somewhere in its history.
    fn ok_to_give_up(&mut self) -> Result<bool> {
        if self.common.is_empty() {
            return Ok(false);
        }
        for want in &self.wants {
            if self.satisfied.contains(want) {
                continue;
            }
            let history = closure::reachable(self.repo, &[*want], &HashSet::new())?;
            if history.iter().any(|id| self.common_set.contains(id)) {
                self.satisfied.insert(*want);
            } else {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// How a round of haves ended.
enum RoundEnd {
    /// More haves or `done` may follow.
    Continue,
    /// `no-done` and the server is ready: the pack follows now.
    Ready,
    /// The client holds everything it wants; nothing to send.
    Satisfied,
}

fn unexpected(line: &str, state: UploadState) -> GitError {
    GitError::Protocol(format!("unexpected line in {:?}: {}", state, line))
}

/// What a finished upload-pack session did.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Capabilities negotiated on the first want.
    pub capabilities: Capabilities,
    /// Accepted wants.
    pub wants: Vec<ObjectId>,
    /// Haves the repository holds.
    pub common: Vec<ObjectId>,
    /// Objects in the pack, `None` when no pack was sent.
    pub objects_sent: Option<u32>,
}

/// Serves one upload-pack request.
pub struct UploadPackSession {
    repo: Arc<dyn Repository>,
    codec: Arc<dyn PackCodec>,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl UploadPackSession {
    /// Creates a session over an already resolved repository.
    pub fn new(repo: Arc<dyn Repository>, codec: Arc<dyn PackCodec>, config: SessionConfig) -> Self {
        Self {
            repo,
            codec,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Aborts the session when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Protocol knobs of this session.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Writes the ref advertisement only, as served to a smart-HTTP `info/refs` request.
    pub fn advertise<W: Write>(&self, output: W) -> Result<Advertisement> {
        advertise(
            &mut PktLineWriter::new(output),
            &*self.repo,
            ServiceKind::UploadPack,
            &self.config,
        )
    }

    /// Runs the session to completion.
    ///
    /// Advertises first unless the session is stateless, in which case the
    /// client already saw the advertisement on a previous request.
    pub fn run<R: Read, W: Write>(&self, input: R, output: W) -> Result<UploadOutcome> {
        let mut writer = PktLineWriter::new(output);
        let advertisement = if self.config.stateless_rpc {
            Advertisement::build(&*self.repo, ServiceKind::UploadPack, &self.config)?
        } else {
            advertise(&mut writer, &*self.repo, ServiceKind::UploadPack, &self.config)?
        };

        let mut reader = PktLineReader::new(input);
        let mut negotiation = Negotiation::new(&*self.repo, &self.config, &advertisement);
        let mut state = UploadState::AwaitWants;

        while !matches!(state, UploadState::PackGeneration | UploadState::Done) {
            cancel::check(&self.cancel)?;
            let frame = reader.read()?;
            let step = match negotiation.transition(state, frame) {
                Ok(step) => step,
                Err(GitError::UnknownWant(id)) => {
                    writer.write_error(&format!("upload-pack: not our ref {}", id))?;
                    writer.flush()?;
                    return Err(GitError::UnknownWant(id));
                }
                Err(e) => return Err(e),
            };
            for reply in &step.replies {
                writer.write_line(reply)?;
            }
            writer.flush()?;
            if step.next != state {
                tracing::debug!(from = ?state, to = ?step.next, "upload-pack transition");
            }
            state = step.next;
        }

        let objects_sent = if state == UploadState::PackGeneration {
            Some(self.send_pack(&mut writer, &negotiation)?)
        } else {
            None
        };

        tracing::info!(
            wants = negotiation.wants().len(),
            common = negotiation.common().len(),
            objects = objects_sent.unwrap_or(0),
            "upload-pack finished"
        );
        Ok(UploadOutcome {
            capabilities: negotiation.capabilities().clone(),
            wants: negotiation.wants().to_vec(),
            common: negotiation.common().to_vec(),
            objects_sent,
        })
    }

    fn send_pack<W: Write>(
        &self,
        writer: &mut PktLineWriter<W>,
        negotiation: &Negotiation<'_>,
    ) -> Result<u32> {
        let caps = negotiation.capabilities();
        let mode = SidebandMode::from_capabilities(caps);
        let progress = mode.is_enabled() && !caps.contains(NO_PROGRESS);

        if self.cancel.is_cancelled() {
            self.abort(writer, mode, "aborted");
            return Err(GitError::Cancelled);
        }

        let objects =
            match closure::compute_closure(&*self.repo, negotiation.wants(), negotiation.common()) {
                Ok(objects) => objects,
                Err(e) => {
                    tracing::error!(error = %e, "object enumeration failed");
                    self.abort(writer, mode, &e.to_string());
                    return Err(e);
                }
            };
        if progress {
            let msg = format!("Enumerating objects: {}, done.\n", objects.len());
            write_band(writer.get_mut(), mode, Band::Progress, msg.as_bytes())?;
        }

        let out = writer.get_mut();
        let result = if mode.is_enabled() {
            let mut band = SidebandWriter::new(out, mode);
            let mut guarded = CancellableWriter::new(&mut band, &self.cancel);
            self.codec.generate_pack(&*self.repo, &objects, &mut guarded)
        } else {
            let mut guarded = CancellableWriter::new(out, &self.cancel);
            self.codec.generate_pack(&*self.repo, &objects, &mut guarded)
        };

        match result {
            Ok(count) => {
                if mode.is_enabled() {
                    if progress {
                        let msg = format!("Total {}\n", count);
                        write_band(writer.get_mut(), mode, Band::Progress, msg.as_bytes())?;
                    }
                    writer.flush_pkt()?;
                }
                writer.flush()?;
                Ok(count)
            }
            Err(e) => {
                let err = if self.cancel.is_cancelled() {
                    GitError::Cancelled
                } else {
                    GitError::from(e)
                };
                tracing::error!(error = %err, "pack transfer aborted");
                let msg = match err {
                    GitError::Cancelled => "aborted".to_string(),
                    ref other => other.to_string(),
                };
                self.abort(writer, mode, &msg);
                Err(err)
            }
        }
    }

    /// Best-effort termination marker: channel 3 with sideband, else an ERR
    /// line. Without sideband, once pack bytes are out there is no marker
    /// the client can tell apart from pack data; the connection just closes.
    fn abort<W: Write>(&self, writer: &mut PktLineWriter<W>, mode: SidebandMode, msg: &str) {
        let written = if mode.is_enabled() {
            write_band(writer.get_mut(), mode, Band::Error, format!("{}\n", msg).as_bytes())
        } else {
            writer.write_error(msg)
        };
        if let Err(e) = written.and_then(|_| writer.flush()) {
            tracing::debug!(error = %e, "could not deliver abort marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitway_storage::{
        BasicPackCodec, GitObject, HashAlgorithm, MemoryRepository, RefUpdate, RefUpdateError,
        ReferenceSet, StorageError, TreeEntry,
    };
    use std::io::{BufRead, Cursor};

    struct Fixture {
        repo: Arc<MemoryRepository>,
        commits: Vec<ObjectId>,
        advertisement: Advertisement,
        config: SessionConfig,
    }

    // c0 <- c1 <- c2 on refs/heads/main
    fn fixture(config: SessionConfig) -> Fixture {
        let repo = Arc::new(MemoryRepository::new("r"));
        let mut commits: Vec<ObjectId> = Vec::new();
        for i in 0..3 {
            let blob = repo
                .write_object(GitObject::blob(format!("v{}", i).into_bytes()))
                .unwrap();
            let tree = repo
                .write_object(GitObject::tree(&[TreeEntry::file("f", blob)]))
                .unwrap();
            let parents: Vec<ObjectId> = commits.last().copied().into_iter().collect();
            let c = repo
                .write_object(GitObject::commit(&tree, &parents, "a <a@x> 0 +0000", "a <a@x> 0 +0000", "m"))
                .unwrap();
            commits.push(c);
        }
        repo.refs.set("refs/heads/main", commits[2]);
        let advertisement =
            Advertisement::build(&*repo, ServiceKind::UploadPack, &config).unwrap();
        Fixture {
            repo,
            commits,
            advertisement,
            config,
        }
    }

    fn data(s: &str) -> Option<PktLine> {
        Some(PktLine::from_string(&format!("{}\n", s)))
    }

    #[test]
    fn test_early_done_without_haves() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);

        let t = n
            .transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[2])))
            .unwrap();
        assert_eq!(t.next, UploadState::AwaitWants);

        let t = n.transition(UploadState::AwaitWants, data("done")).unwrap();
        assert_eq!(t.next, UploadState::PackGeneration);
        assert_eq!(t.replies, vec!["NAK"]);
    }

    #[test]
    fn test_flush_without_wants_ends_session() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        let t = n.transition(UploadState::AwaitWants, Some(PktLine::Flush)).unwrap();
        assert_eq!(t.next, UploadState::Done);
        let t = n.transition(UploadState::AwaitWants, None);
        assert_eq!(t.unwrap().next, UploadState::Done);
    }

    #[test]
    fn test_first_want_carries_capabilities() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(
            UploadState::AwaitWants,
            data(&format!("want {} multi_ack_detailed side-band-64k bogus", f.commits[2])),
        )
        .unwrap();
        assert_eq!(n.ack_mode(), AckMode::Detailed);
        assert!(n.capabilities().contains("side-band-64k"));
        assert!(!n.capabilities().contains("bogus"));
    }

    #[test]
    fn test_unknown_want_rejected() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        // c1 exists but is not a tip.
        let err = n
            .transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[1])))
            .unwrap_err();
        assert!(matches!(err, GitError::UnknownWant(id) if id == f.commits[1]));
    }

    #[test]
    fn test_reachable_want_allowed_when_configured() {
        let f = fixture(SessionConfig {
            allow_reachable_sha1_in_want: true,
            ..SessionConfig::default()
        });
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[0])))
            .unwrap();
        assert_eq!(n.wants(), &[f.commits[0]]);
    }

    #[test]
    fn test_lenient_wants_skip_missing() {
        let f = fixture(SessionConfig {
            strict_wants: false,
            ..SessionConfig::default()
        });
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        let missing = ObjectId::from_bytes([7; 20]);
        n.transition(UploadState::AwaitWants, data(&format!("want {}", missing)))
            .unwrap();
        n.transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[1])))
            .unwrap();
        assert_eq!(n.wants(), &[f.commits[1]]);
    }

    #[test]
    fn test_single_ack_mode() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[2])))
            .unwrap();
        n.transition(UploadState::AwaitWants, Some(PktLine::Flush)).unwrap();

        // Without multi_ack no have is acknowledged during the round.
        for have in [ObjectId::from_bytes([3; 20]), f.commits[1], f.commits[0]] {
            let t = n
                .transition(UploadState::AwaitHaves, data(&format!("have {}", have)))
                .unwrap();
            assert!(t.replies.is_empty());
        }

        let t = n.transition(UploadState::AwaitHaves, Some(PktLine::Flush)).unwrap();
        assert_eq!(t.next, UploadState::Negotiating);
        assert_eq!(t.replies, vec!["NAK"]);

        let t = n.transition(UploadState::Negotiating, data("done")).unwrap();
        assert_eq!(t.next, UploadState::PackGeneration);
        assert_eq!(t.replies, vec![format!("ACK {}", f.commits[0])]);
        assert_eq!(n.common(), &[f.commits[1], f.commits[0]]);
    }

    #[test]
    fn test_single_ack_nak_when_haves_cover_wants() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[2])))
            .unwrap();
        n.transition(UploadState::AwaitWants, Some(PktLine::Flush)).unwrap();
        let t = n
            .transition(UploadState::AwaitHaves, data(&format!("have {}", f.commits[2])))
            .unwrap();
        assert!(t.replies.is_empty());

        let t = n.transition(UploadState::AwaitHaves, Some(PktLine::Flush)).unwrap();
        assert_eq!(t.next, UploadState::Done);
        assert_eq!(t.replies, vec!["NAK"]);
    }

    #[test]
    fn test_single_ack_done_with_covered_wants_sends_no_pack() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[2])))
            .unwrap();
        n.transition(UploadState::AwaitWants, Some(PktLine::Flush)).unwrap();
        n.transition(UploadState::AwaitHaves, data(&format!("have {}", f.commits[2])))
            .unwrap();

        let t = n.transition(UploadState::AwaitHaves, data("done")).unwrap();
        assert_eq!(t.next, UploadState::Done);
        assert_eq!(t.replies, vec!["NAK"]);
    }

    #[test]
    fn test_stateless_session_with_covered_wants_is_nak_only() {
        let f = fixture(SessionConfig {
            stateless_rpc: true,
            ..SessionConfig::default()
        });
        let session = UploadPackSession::new(f.repo.clone(), Arc::new(BasicPackCodec), f.config.clone());
        let mut input = PktLineWriter::new(Vec::<u8>::new());
        input.write_line(&format!("want {}", f.commits[2])).unwrap();
        input.flush_pkt().unwrap();
        input.write_line(&format!("have {}", f.commits[2])).unwrap();
        input.flush_pkt().unwrap();

        let mut out = Vec::new();
        let outcome = session.run(Cursor::new(input.into_inner()), &mut out).unwrap();
        assert_eq!(outcome.objects_sent, None);
        let lines: Vec<PktLine> = PktLineReader::new(Cursor::new(out))
            .map(|p| p.unwrap())
            .collect();
        assert_eq!(lines, vec![PktLine::from_string("NAK\n")]);
    }

    #[test]
    fn test_nak_when_nothing_common() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[2])))
            .unwrap();
        n.transition(UploadState::AwaitWants, Some(PktLine::Flush)).unwrap();
        n.transition(UploadState::AwaitHaves, data(&format!("have {}", ObjectId::from_bytes([1; 20]))))
            .unwrap();
        let t = n.transition(UploadState::AwaitHaves, Some(PktLine::Flush)).unwrap();
        assert_eq!(t.replies, vec!["NAK"]);
        let t = n.transition(UploadState::Negotiating, data("done")).unwrap();
        assert_eq!(t.replies, vec!["NAK"]);
    }

    #[test]
    fn test_multi_ack_continue() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(
            UploadState::AwaitWants,
            data(&format!("want {} multi_ack", f.commits[2])),
        )
        .unwrap();
        n.transition(UploadState::AwaitWants, Some(PktLine::Flush)).unwrap();

        let t = n
            .transition(UploadState::AwaitHaves, data(&format!("have {}", f.commits[1])))
            .unwrap();
        assert_eq!(t.replies, vec![format!("ACK {} continue", f.commits[1])]);

        let t = n.transition(UploadState::AwaitHaves, Some(PktLine::Flush)).unwrap();
        assert_eq!(t.replies, vec!["NAK"]);

        let t = n.transition(UploadState::Negotiating, data("done")).unwrap();
        assert_eq!(t.replies, vec![format!("ACK {}", f.commits[1])]);
    }

    #[test]
    fn test_detailed_ready_and_no_done() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(
            UploadState::AwaitWants,
            data(&format!("want {} multi_ack_detailed no-done", f.commits[2])),
        )
        .unwrap();
        n.transition(UploadState::AwaitWants, Some(PktLine::Flush)).unwrap();

        let t = n
            .transition(UploadState::AwaitHaves, data(&format!("have {}", f.commits[1])))
            .unwrap();
        assert_eq!(t.replies, vec![format!("ACK {} common", f.commits[1])]);

        let t = n.transition(UploadState::AwaitHaves, Some(PktLine::Flush)).unwrap();
        assert_eq!(
            t.replies,
            vec![
                format!("ACK {} ready", f.commits[1]),
                "NAK".to_string(),
                format!("ACK {}", f.commits[1]),
            ]
        );
        assert_eq!(t.next, UploadState::PackGeneration);
    }

    #[test]
    fn test_stateless_round_ends_session() {
        let f = fixture(SessionConfig {
            stateless_rpc: true,
            ..SessionConfig::default()
        });
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        n.transition(UploadState::AwaitWants, data(&format!("want {}", f.commits[2])))
            .unwrap();
        n.transition(UploadState::AwaitWants, Some(PktLine::Flush)).unwrap();
        let t = n.transition(UploadState::AwaitHaves, Some(PktLine::Flush)).unwrap();
        assert_eq!(t.next, UploadState::Done);
        assert_eq!(t.replies, vec!["NAK"]);
    }

    #[test]
    fn test_unexpected_lines() {
        let f = fixture(SessionConfig::default());
        let mut n = Negotiation::new(&*f.repo, &f.config, &f.advertisement);
        assert!(matches!(
            n.transition(UploadState::AwaitWants, data("have 1234")),
            Err(GitError::Protocol(_))
        ));
        assert!(matches!(
            n.transition(UploadState::AwaitWants, Some(PktLine::Delimiter)),
            Err(GitError::Protocol(_))
        ));
        assert!(matches!(
            n.transition(UploadState::Done, Some(PktLine::Flush)),
            Err(GitError::Protocol(_))
        ));
        assert!(matches!(
            n.transition(UploadState::AwaitWants, data("want nothex")),
            Err(GitError::Protocol(_))
        ));
    }

    #[test]
    fn test_session_writes_err_for_unknown_want() {
        let f = fixture(SessionConfig::default());
        let session = UploadPackSession::new(f.repo.clone(), Arc::new(BasicPackCodec), f.config.clone());
        let bogus = ObjectId::from_bytes([0xee; 20]);
        let mut input = Vec::new();
        input.extend(crate::pktline::encode(format!("want {}\n", bogus).as_bytes()).unwrap());
        input.extend_from_slice(b"0000");

        let mut out = Vec::new();
        let err = session.run(Cursor::new(input), &mut out).unwrap_err();
        assert!(matches!(err, GitError::UnknownWant(_)));
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains(&format!("ERR upload-pack: not our ref {}", bogus)));
    }

    /// Emits the first bytes of a pack, then fires the session's token.
    struct CancelMidPack {
        token: CancellationToken,
    }

    impl PackCodec for CancelMidPack {
        fn generate_pack(
            &self,
            _repo: &dyn Repository,
            objects: &[ObjectId],
            out: &mut dyn Write,
        ) -> gitway_storage::Result<u32> {
            out.write_all(b"PACK\0\0\0\x02")?;
            self.token.cancel();
            out.write_all(&(objects.len() as u32).to_be_bytes())?;
            Ok(objects.len() as u32)
        }

        fn ingest_pack(
            &self,
            repo: &dyn Repository,
            input: &mut dyn BufRead,
        ) -> gitway_storage::Result<Vec<ObjectId>> {
            BasicPackCodec.ingest_pack(repo, input)
        }
    }

    /// A repository whose object graph cannot be walked.
    struct UnwalkableRepository(Arc<MemoryRepository>);

    impl Repository for UnwalkableRepository {
        fn hash_algorithm(&self) -> HashAlgorithm {
            self.0.hash_algorithm()
        }

        fn list_refs(&self) -> gitway_storage::Result<ReferenceSet> {
            self.0.list_refs()
        }

        fn head_target(&self) -> gitway_storage::Result<Option<String>> {
            self.0.head_target()
        }

        fn read_ref(&self, name: &str) -> gitway_storage::Result<Option<ObjectId>> {
            self.0.read_ref(name)
        }

        fn apply_updates(
            &self,
            updates: &[RefUpdate],
            atomic: bool,
        ) -> gitway_storage::Result<Vec<std::result::Result<(), RefUpdateError>>> {
            self.0.apply_updates(updates, atomic)
        }

        fn read_object(&self, id: &ObjectId) -> gitway_storage::Result<Option<GitObject>> {
            self.0.read_object(id)
        }

        fn write_object(&self, object: GitObject) -> gitway_storage::Result<ObjectId> {
            self.0.write_object(object)
        }

        fn object_links(&self, _id: &ObjectId) -> gitway_storage::Result<Vec<ObjectId>> {
            Err(StorageError::Corruption("object graph unreadable".to_string()))
        }
    }

    fn clone_request(want: ObjectId, caps: &str) -> Vec<u8> {
        let mut input = PktLineWriter::new(Vec::<u8>::new());
        input.write_line(&format!("want {} {}", want, caps)).unwrap();
        input.flush_pkt().unwrap();
        input.write_line("done").unwrap();
        input.into_inner()
    }

    #[test]
    fn test_cancel_during_pack_ends_with_abort_band() {
        let f = fixture(SessionConfig {
            stateless_rpc: true,
            ..SessionConfig::default()
        });
        let token = CancellationToken::new();
        let codec = Arc::new(CancelMidPack {
            token: token.clone(),
        });
        let session = UploadPackSession::new(f.repo.clone(), codec, f.config.clone())
            .with_cancellation(token);

        let mut out = Vec::new();
        let err = session
            .run(Cursor::new(clone_request(f.commits[2], "side-band-64k")), &mut out)
            .unwrap_err();
        assert!(matches!(err, GitError::Cancelled));

        let frames: Vec<PktLine> = PktLineReader::new(Cursor::new(out))
            .map(|p| p.unwrap())
            .collect();
        assert_eq!(frames[0].as_str(), Some("NAK"));
        let data_frames: Vec<&[u8]> = frames[1..frames.len() - 1]
            .iter()
            .filter_map(|p| p.data())
            .filter(|d| d[0] == Band::Data as u8)
            .collect();
        assert_eq!(data_frames, vec![&b"\x01PACK\0\0\0\x02"[..]]);
        assert_eq!(
            frames.last(),
            Some(&PktLine::Data(b"\x03aborted\n".to_vec()))
        );
    }

    #[test]
    fn test_closure_failure_reported_before_pack() {
        let f = fixture(SessionConfig {
            stateless_rpc: true,
            ..SessionConfig::default()
        });
        let repo = Arc::new(UnwalkableRepository(f.repo.clone()));
        let session = UploadPackSession::new(repo, Arc::new(BasicPackCodec), f.config.clone());

        let mut out = Vec::new();
        let err = session
            .run(Cursor::new(clone_request(f.commits[2], "ofs-delta")), &mut out)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Backend);

        let lines: Vec<String> = PktLineReader::new(Cursor::new(out.clone()))
            .map(|p| p.unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "NAK");
        assert!(lines[1].starts_with("ERR "));
        assert!(lines[1].contains("object graph unreadable"));
        assert!(!out.windows(4).any(|w| w == b"PACK"));
    }

    #[test]
    fn test_closure_failure_uses_error_band_with_sideband() {
        let f = fixture(SessionConfig {
            stateless_rpc: true,
            ..SessionConfig::default()
        });
        let repo = Arc::new(UnwalkableRepository(f.repo.clone()));
        let session = UploadPackSession::new(repo, Arc::new(BasicPackCodec), f.config.clone());

        let mut out = Vec::new();
        session
            .run(Cursor::new(clone_request(f.commits[2], "side-band-64k")), &mut out)
            .unwrap_err();

        let frames: Vec<PktLine> = PktLineReader::new(Cursor::new(out))
            .map(|p| p.unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_str(), Some("NAK"));
        let last = frames[1].data().unwrap();
        assert_eq!(last[0], Band::Error as u8);
        assert!(String::from_utf8_lossy(last).contains("object graph unreadable"));
    }

    #[test]
    fn test_cancelled_before_negotiation() {
        let f = fixture(SessionConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        let session = UploadPackSession::new(f.repo.clone(), Arc::new(BasicPackCodec), f.config.clone())
            .with_cancellation(token);
        let err = session.run(Cursor::new(Vec::<u8>::new()), Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, GitError::Cancelled));
    }
}
