//! Quilt resolver: turns the profile ids a resource tree references into
//! normalized, merge-ready profiles.
//!
//! One batch fetch is issued per distinct profile type; batches run
//! concurrently and are all awaited before anything is classified.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use futures::future::join_all;
use quilt_core::{ConfigParser, DynamicAttrs, ProfileId, ProfileType, Resolution, ResolvedProfile};
use quilt_store::ProfileStore;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Distinct (type, id) pairs wanted by one composition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileRequest {
    wanted: BTreeMap<ProfileType, BTreeSet<ProfileId>>,
}

impl ProfileRequest {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, profile_type: ProfileType, id: ProfileId) {
        self.wanted.entry(profile_type).or_default().insert(id);
    }

    pub fn add_opt(&mut self, profile_type: ProfileType, id: Option<ProfileId>) {
        if let Some(id) = id { self.add(profile_type, id); }
    }

    pub fn add_attrs(&mut self, profile_type: ProfileType, attrs: &DynamicAttrs) {
        for (_, id) in attrs.iter() { self.add(profile_type, id); }
    }

    pub fn types(&self) -> impl Iterator<Item = ProfileType> + '_ { self.wanted.keys().copied() }

    pub fn ids(&self, profile_type: ProfileType) -> Option<&BTreeSet<ProfileId>> { self.wanted.get(&profile_type) }

    /// Number of distinct (type, id) pairs.
    pub fn len(&self) -> usize { self.wanted.values().map(|s| s.len()).sum() }

    pub fn is_empty(&self) -> bool { self.wanted.is_empty() }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("store fetch for {profile_type} failed: {message}")]
    Store { profile_type: ProfileType, message: String },
    #[error("profile {id} has type {found}, expected {expected}")]
    TypeMismatch { id: ProfileId, expected: ProfileType, found: ProfileType },
    #[error("resolve cancelled")]
    Cancelled,
}

/// Everything one resolve call produced. Owned by a single composition.
#[derive(Debug, Clone, Default)]
pub struct ResolvedProfiles {
    by_key: FxHashMap<(ProfileType, ProfileId), ResolvedProfile>,
    unresolved: BTreeSet<(ProfileType, ProfileId)>,
}

impl ResolvedProfiles {
    pub fn lookup(&self, profile_type: ProfileType, id: ProfileId) -> Resolution<'_> {
        match self.by_key.get(&(profile_type, id)) {
            Some(p) => Resolution::Resolved(p),
            None => Resolution::Unresolved,
        }
    }

    pub fn lookup_opt(&self, profile_type: ProfileType, id: Option<ProfileId>) -> Resolution<'_> {
        match id {
            Some(id) => self.lookup(profile_type, id),
            None => Resolution::Unresolved,
        }
    }

    pub fn len(&self) -> usize { self.by_key.len() }
    pub fn is_empty(&self) -> bool { self.by_key.is_empty() }

    /// Requested pairs the store did not return, in (type, id) order.
    pub fn unresolved(&self) -> impl Iterator<Item = (ProfileType, ProfileId)> + '_ { self.unresolved.iter().copied() }

    pub fn parse_failures(&self) -> usize { self.by_key.values().filter(|p| p.parsed.is_err()).count() }

    /// Insert a profile directly; used to build fixtures without a store.
    pub fn insert(&mut self, resolved: ResolvedProfile) {
        let key = (resolved.profile.profile_type, resolved.profile.id);
        self.unresolved.remove(&key);
        self.by_key.insert(key, resolved);
    }
}

/// Stateless between calls; borrows the store for its lifetime.
pub struct ProfileResolver<'s, S: ?Sized> {
    store: &'s S,
    parser: ConfigParser,
}

impl<'s, S: ProfileStore + ?Sized> ProfileResolver<'s, S> {
    pub fn new(store: &'s S, parser: ConfigParser) -> Self { Self { store, parser } }

    pub async fn resolve(&self, request: &ProfileRequest, namespace: &str) -> Result<ResolvedProfiles, ResolveError> {
        self.resolve_with_cancel(request, namespace, &CancellationToken::new()).await
    }

    /// Fetch every batch, wait for all of them, then classify. A store
    /// failure in one batch fails the call only after the others finished.
    pub async fn resolve_with_cancel(
        &self,
        request: &ProfileRequest,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedProfiles, ResolveError> {
        let mut out = ResolvedProfiles::default();
        if request.is_empty() {
            return Ok(out);
        }
        let t0 = Instant::now();
        metrics::histogram!("resolve_profiles_requested", request.len() as f64);

        let batches = request.wanted.iter().map(|(t, ids)| {
            let t = *t;
            async move { (t, ids, self.store.fetch_by_ids(t, ids, namespace).await) }
        });
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
            joined = join_all(batches) => joined,
        };

        let mut first_err: Option<ResolveError> = None;
        for (t, ids, res) in joined {
            metrics::counter!("resolve_batches_total", 1u64, "type" => t.as_str());
            let profiles = match res {
                Ok(p) => p,
                Err(e) => {
                    warn!(profile_type = %t, ns = %namespace, error = %e, "profile batch fetch failed");
                    first_err.get_or_insert(ResolveError::Store { profile_type: t, message: format!("{:#}", e) });
                    continue;
                }
            };
            debug!(profile_type = %t, requested = ids.len(), found = profiles.len(), "profile batch fetched");
            for p in profiles {
                if !ids.contains(&p.id) {
                    debug!(id = p.id, profile_type = %t, "store returned an unrequested profile; ignored");
                    continue;
                }
                if p.profile_type != t {
                    first_err.get_or_insert(ResolveError::TypeMismatch { id: p.id, expected: t, found: p.profile_type });
                    continue;
                }
                let resolved = ResolvedProfile::new(p, &self.parser);
                if let Err(e) = &resolved.parsed {
                    warn!(id = resolved.profile.id, profile_type = %t, error = %e, "profile config failed to parse");
                    metrics::counter!("profile_parse_errors_total", 1u64);
                }
                out.by_key.insert((t, resolved.profile.id), resolved);
            }
            for id in ids {
                if !out.by_key.contains_key(&(t, *id)) {
                    out.unresolved.insert((t, *id));
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        self.classify_misses(&out.unresolved, namespace, cancel).await?;
        for (t, id) in out.unresolved.iter() {
            warn!(id = *id, profile_type = %t, ns = %namespace, "dangling profile reference");
            metrics::counter!("profile_unresolved_total", 1u64);
        }
        debug!(resolved = out.len(), unresolved = out.unresolved.len(), took_ms = %t0.elapsed().as_millis(), "resolve done");
        Ok(out)
    }

    /// A miss whose id exists under another type is a mismatch; anything
    /// else stays dangling. One store call covers every miss.
    async fn classify_misses(
        &self,
        misses: &BTreeSet<(ProfileType, ProfileId)>,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ResolveError> {
        let Some((first_type, _)) = misses.iter().next().copied() else {
            return Ok(());
        };
        let ids: BTreeSet<ProfileId> = misses.iter().map(|(_, id)| *id).collect();
        let found = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
            res = self.store.profile_types(&ids, namespace) => res.map_err(|e| ResolveError::Store {
                profile_type: first_type,
                message: format!("{:#}", e),
            })?,
        };
        for (expected, id) in misses.iter().copied() {
            if let Some((_, found)) = found.iter().find(|(fid, ft)| *fid == id && *ft != expected) {
                warn!(id, expected = %expected, found = %found, ns = %namespace, "profile referenced under the wrong type");
                return Err(ResolveError::TypeMismatch { id, expected, found: *found });
            }
        }
        Ok(())
    }
}
