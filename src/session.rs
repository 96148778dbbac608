//! Exclusive ownership of the TPM channel and of every transient resource
//! opened through it.

use log::{debug, info, trace, warn};
use tss_esapi::{
    Context,
    attributes::SessionAttributesBuilder,
    constants::{CapabilityType, PropertyTag, SessionType, StartupType},
    handles::{ObjectHandle, SessionHandle, TpmHandle},
    interface_types::{algorithm::HashingAlgorithm, session_handles::AuthSession},
    constants::response_code::Tss2ResponseCodeKind,
    structures::{Auth, CapabilityData, SymmetricDefinition},
};

use crate::{
    Error, Result, Step,
    config::{AuthStrategy, SessionConfig, tcti_name_conf},
    error::response_kind,
};

/// Upper bound on handles returned by a single `TPM2_GetCapability`.
const MAX_CAP_HANDLES: u32 = 254;

/// Minimum transient pool mandated by the PC client profile.
const FALLBACK_TRANSIENT_LIMIT: usize = 3;

/// Ranges of the handle types that can be left behind by a crashed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Transient,
    LoadedSession,
    SavedSession,
}

impl HandleKind {
    pub const ALL: [HandleKind; 3] = [
        HandleKind::LoadedSession,
        HandleKind::SavedSession,
        HandleKind::Transient,
    ];

    fn range(self) -> (u32, u32) {
        match self {
            HandleKind::Transient => (0x8000_0000, 0x80FF_FFFF),
            HandleKind::LoadedSession => (0x0200_0000, 0x02FF_FFFF),
            HandleKind::SavedSession => (0x0300_0000, 0x03FF_FFFF),
        }
    }

    /// Parses `all`, `transient`, `loaded` or `saved`.
    pub fn parse_set(s: &str) -> Result<Vec<HandleKind>> {
        match s {
            "all" => Ok(Self::ALL.to_vec()),
            "transient" => Ok(vec![HandleKind::Transient]),
            "loaded" => Ok(vec![HandleKind::LoadedSession]),
            "saved" => Ok(vec![HandleKind::SavedSession]),
            unknown => Err(Error::Config(format!("unknown handle kind: {unknown:?}"))),
        }
    }
}

/// A resource that must be given back to the device before the channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Object(ObjectHandle),
    AuthSession(AuthSession),
}

/// The single owner of the device channel.
///
/// Every transient object created, loaded or context-loaded through the
/// session is pushed onto a release stack; on [`Session::close`] or drop the
/// stack is unwound in reverse order and the channel is closed afterwards.
pub struct Session {
    ctx: Context,
    auth_strategy: AuthStrategy,
    hmac_session: Option<AuthSession>,
    releases: Vec<Release>,
    transient_limit: usize,
}

impl Session {
    pub fn open(config: &SessionConfig) -> Result<Self> {
        let conf = tcti_name_conf(&config.tcti)?;
        let mut ctx = Context::new(conf).map_err(|e| Error::device(Step::Open, None, e))?;
        info!("opened TPM channel {}", config.tcti);

        match ctx.startup(StartupType::Clear) {
            Ok(()) => debug!("TPM started"),
            Err(e) if response_kind(&e) == Some(Tss2ResponseCodeKind::Initialize) => {
                debug!("TPM already started");
            }
            Err(e) => return Err(Error::device(Step::Startup, None, e)),
        }

        let owner_auth = Auth::try_from(config.owner_auth.clone())
            .map_err(|e| Error::device(Step::SetAuth, None, e))?;
        ctx.tr_set_auth(ObjectHandle::Owner, owner_auth)
            .map_err(|e| Error::device(Step::SetAuth, None, e))?;

        let transient_limit = match config.transient_limit {
            Some(limit) => limit,
            None => ctx
                .get_tpm_property(PropertyTag::HrTransientMin)
                .map_err(|e| Error::device(Step::Capability, None, e))?
                .map(|v| v as usize)
                .unwrap_or(FALLBACK_TRANSIENT_LIMIT),
        };
        debug!("transient pool limit: {transient_limit}");

        let mut session = Self {
            ctx,
            auth_strategy: config.auth_strategy,
            hmac_session: None,
            releases: Vec::new(),
            transient_limit,
        };

        if session.auth_strategy == AuthStrategy::Hmac {
            session.start_hmac_session()?;
        }

        Ok(session)
    }

    fn start_hmac_session(&mut self) -> Result<()> {
        let auth_session = self
            .ctx
            .execute_without_session(|ctx| {
                ctx.start_auth_session(
                    None,
                    None,
                    None,
                    SessionType::Hmac,
                    SymmetricDefinition::AES_128_CFB,
                    HashingAlgorithm::Sha256,
                )
            })
            .map_err(|e| Error::device(Step::StartAuthSession, None, e))?
            .ok_or_else(|| Error::Config("device returned no auth session".to_string()))?;

        // Parameter encryption is left off: EvictControl has no encryptable parameter.
        let (attributes, mask) = SessionAttributesBuilder::new()
            .with_continue_session(true)
            .build();
        self.ctx
            .tr_sess_set_attributes(auth_session, attributes, mask)
            .map_err(|e| Error::device(Step::StartAuthSession, None, e))?;

        self.releases.push(Release::AuthSession(auth_session));
        self.hmac_session = Some(auth_session);
        debug!("started HMAC auth session");
        Ok(())
    }

    /// Raw request/response access for commands that need no authorization.
    pub fn context(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Runs `f` with the configured authorization session in the first slot.
    pub fn authorized<T>(&mut self, f: impl FnOnce(&mut Context) -> T) -> T {
        let auth = self.hmac_session.unwrap_or(AuthSession::Password);
        self.ctx.execute_with_session(Some(auth), f)
    }

    /// Whether commands currently go out under an HMAC session.
    pub fn uses_hmac(&self) -> bool {
        self.hmac_session.is_some()
    }

    pub fn transient_limit(&self) -> usize {
        self.transient_limit
    }

    pub fn transient_in_use(&self) -> usize {
        self.releases
            .iter()
            .filter(|r| matches!(r, Release::Object(_)))
            .count()
    }

    /// Fails with `ResourceExhaustion` when no transient slot is left for `step`.
    pub(crate) fn reserve(&self, step: Step) -> Result<()> {
        let in_use = self.transient_in_use();
        if in_use >= self.transient_limit {
            return Err(Error::ResourceExhaustion {
                step,
                slots: Some((in_use, self.transient_limit)),
            });
        }
        Ok(())
    }

    /// Registers a freshly opened transient object for release.
    pub(crate) fn track(&mut self, handle: ObjectHandle) {
        trace!("tracking transient object {handle:?}");
        self.releases.push(Release::Object(handle));
    }

    /// Flushes a tracked transient object and drops it from the release stack.
    pub fn release(&mut self, handle: ObjectHandle) -> Result<()> {
        self.untrack(handle);
        self.ctx
            .flush_context(handle)
            .map_err(|e| Error::device(Step::Flush, None, e))?;
        trace!("flushed transient object {handle:?}");
        Ok(())
    }

    fn untrack(&mut self, handle: ObjectHandle) {
        if let Some(pos) = self
            .releases
            .iter()
            .rposition(|r| *r == Release::Object(handle))
        {
            self.releases.remove(pos);
        }
    }

    /// Lists the device handles of `kind` currently loaded.
    pub fn handles(&mut self, kind: HandleKind) -> Result<Vec<TpmHandle>> {
        let (first, last) = kind.range();
        let mut found = Vec::new();
        let mut property = first;

        loop {
            let (data, more) = self
                .ctx
                .get_capability(CapabilityType::Handles, property, MAX_CAP_HANDLES)
                .map_err(|e| Error::device(Step::Capability, Some(property), e))?;

            let CapabilityData::Handles(list) = data else {
                return Err(Error::Config(format!(
                    "device answered a handle query with {data:?}"
                )));
            };

            let mut last_seen = None;
            for handle in list.iter() {
                let value = u32::from(*handle);
                if value > last {
                    break;
                }
                found.push(*handle);
                last_seen = Some(value);
            }

            match (more, last_seen) {
                (true, Some(value)) if value < last => property = value + 1,
                _ => break,
            }
        }

        Ok(found)
    }

    /// Flushes every loaded handle of `kind`, returning how many were flushed.
    ///
    /// Safe to call with nothing loaded.
    pub fn flush_transient(&mut self, kind: HandleKind) -> Result<usize> {
        let handles = self.handles(kind)?;

        for handle in &handles {
            let value = u32::from(*handle);
            let object = self
                .ctx
                .execute_without_session(|ctx| ctx.tr_from_tpm_public(*handle))
                .map_err(|e| Error::device(Step::FlushTransient, Some(value), e))?;
            self.ctx
                .flush_context(object)
                .map_err(|e| Error::device(Step::FlushTransient, Some(value), e))?;
            debug!("handle {value:#010x} flushed");
        }

        if !handles.is_empty() {
            self.forget_flushed(kind);
        }
        info!("{} {kind:?} handles flushed", handles.len());

        // A loaded-session flush takes the HMAC session with it.
        if self.auth_strategy == AuthStrategy::Hmac && self.hmac_session.is_none() {
            warn!("HMAC session was flushed, starting a new one");
            self.start_hmac_session()?;
        }
        Ok(handles.len())
    }

    /// Drops release entries whose device objects were flushed behind our back.
    fn forget_flushed(&mut self, kind: HandleKind) {
        let (stale, kept): (Vec<_>, Vec<_>) =
            self.releases.drain(..).partition(|r| match (r, kind) {
                (Release::Object(_), HandleKind::Transient) => true,
                (Release::AuthSession(_), HandleKind::LoadedSession) => true,
                _ => false,
            });
        self.releases = kept;

        for release in stale {
            let mut handle = match release {
                Release::Object(handle) => handle,
                Release::AuthSession(session) => {
                    self.hmac_session = None;
                    ObjectHandle::from(SessionHandle::from(session))
                }
            };
            if let Err(e) = self.ctx.tr_close(&mut handle) {
                warn!("failed to close stale resource {handle:?}: {e}");
            }
        }
    }

    fn unwind(&mut self) -> Vec<Error> {
        let mut errors = Vec::new();

        while let Some(release) = self.releases.pop() {
            let handle = match release {
                Release::Object(handle) => handle,
                Release::AuthSession(session) => {
                    self.hmac_session = None;
                    ObjectHandle::from(SessionHandle::from(session))
                }
            };
            match self.ctx.flush_context(handle) {
                Ok(()) => trace!("released {release:?}"),
                Err(e) => {
                    warn!("failed to release {release:?}: {e}");
                    errors.push(Error::device(Step::Flush, None, e));
                }
            }
        }

        errors
    }

    /// Releases everything still held and closes the channel.
    ///
    /// Every release is attempted; the first failure is returned.
    pub fn close(mut self) -> Result<()> {
        let errors = self.unwind();
        debug!("closing TPM channel");
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Error paths land here; close() has already emptied the stack otherwise.
        let _ = self.unwind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handle_kind_sets() {
        assert_eq!(HandleKind::parse_set("all").unwrap().len(), 3);
        assert_eq!(
            HandleKind::parse_set("loaded").unwrap(),
            vec![HandleKind::LoadedSession]
        );
        assert!(HandleKind::parse_set("everything").is_err());
    }

    #[test]
    fn ranges_do_not_overlap() {
        let mut ranges: Vec<_> = HandleKind::ALL.iter().map(|k| k.range()).collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }
}
