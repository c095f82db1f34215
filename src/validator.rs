use std::marker::PhantomData;

use async_trait::async_trait;

use crate::{
    Error, Result,
    context::{Candidate, CandidateSource, Principal},
    scope::{Scope, ScopeKind, validate_slug},
};

/// Catalog reads needed to validate a candidate identity.
///
/// Implementations must read the catalog unfiltered.
#[async_trait]
pub trait ScopeLookup<K: ScopeKind>: Send + Sync {
    async fn find_by_id(&self, id: K::Id) -> Result<Option<Scope<K>>>;
    async fn find_by_slug(&self, slug: &str) -> Result<Option<Scope<K>>>;
}

#[derive(Debug)]
pub enum Resolution<K: ScopeKind> {
    NoContext,
    Resolved(Scope<K>),
}

impl<K: ScopeKind> Resolution<K> {
    pub fn scope(&self) -> Option<&Scope<K>> {
        match self {
            Resolution::NoContext => None,
            Resolution::Resolved(scope) => Some(scope),
        }
    }
}

/// Validates candidates before anything is bound to a connection.
pub struct Validator<K: ScopeKind, L: ScopeLookup<K>> {
    lookup: L,
    _kind: PhantomData<K>,
}

impl<K: ScopeKind, L: ScopeLookup<K>> Validator<K, L> {
    pub fn new(lookup: L) -> Self {
        Self {
            lookup,
            _kind: PhantomData,
        }
    }

    pub async fn resolve(
        &self,
        candidate: Option<&Candidate>,
        principal: &Principal,
    ) -> Result<Resolution<K>> {
        let Some(candidate) = candidate else {
            return Ok(Resolution::NoContext);
        };

        let scope = if candidate.source == CandidateSource::Host {
            validate_slug(&candidate.value).map_err(|_| unknown::<K>(&candidate.value))?;
            let scope = self
                .lookup
                .find_by_slug(&candidate.value)
                .await?
                .ok_or_else(|| unknown::<K>(&candidate.value))?;
            check_affiliation::<K>(principal, scope.id)?;
            scope
        } else {
            let id = K::parse_id(&candidate.value)?;
            check_affiliation::<K>(principal, id)?;
            self.lookup
                .find_by_id(id)
                .await?
                .ok_or_else(|| unknown::<K>(&candidate.value))?
        };

        if !scope.active {
            return Err(unknown::<K>(&candidate.value));
        }
        Ok(Resolution::Resolved(scope))
    }

    /// Resolves an id that did not come from a request. No affiliation check.
    pub async fn resolve_id(&self, id: K::Id) -> Result<Scope<K>> {
        let value = id.to_string();
        if !K::is_valid_id(&id) {
            return Err(Error::MalformedIdentity {
                kind: K::NAME,
                value,
            });
        }
        match self.lookup.find_by_id(id).await? {
            Some(scope) if scope.active => Ok(scope),
            _ => Err(unknown::<K>(&value)),
        }
    }
}

fn unknown<K: ScopeKind>(value: &str) -> Error {
    Error::UnknownOrInactiveScope {
        kind: K::NAME,
        value: value.to_string(),
    }
}

fn check_affiliation<K: ScopeKind>(principal: &Principal, id: K::Id) -> Result<()> {
    match principal.affiliation() {
        None => Ok(()),
        Some(raw) => match K::parse_id(raw) {
            Ok(own) if own == id => Ok(()),
            _ => Err(Error::ScopeMismatch { kind: K::NAME }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::scope::Tenant;

    #[derive(Default)]
    struct CountingLookup {
        scopes: HashMap<i32, Scope<Tenant>>,
        calls: AtomicUsize,
    }

    impl CountingLookup {
        fn with(scopes: Vec<Scope<Tenant>>) -> Self {
            Self {
                scopes: scopes.into_iter().map(|s| (s.id, s)).collect(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<'a> ScopeLookup<Tenant> for &'a CountingLookup {
        async fn find_by_id(&self, id: i32) -> Result<Option<Scope<Tenant>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scopes.get(&id).cloned())
        }

        async fn find_by_slug(&self, slug: &str) -> Result<Option<Scope<Tenant>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scopes.values().find(|s| s.slug == slug).cloned())
        }
    }

    fn lookup() -> CountingLookup {
        CountingLookup::with(vec![
            Scope::new(1, "Acme", "acme", true),
            Scope::new(2, "Globex", "globex", true),
            Scope::new(3, "Dormant", "dormant", false),
        ])
    }

    fn header(value: &str) -> Candidate {
        Candidate::new(CandidateSource::Header, value)
    }

    #[tokio::test]
    async fn absent_candidate_is_no_context() {
        let lookup = lookup();
        let validator = Validator::<Tenant, _>::new(&lookup);
        let res = validator.resolve(None, &Principal::Anonymous).await.unwrap();
        assert!(matches!(res, Resolution::NoContext));
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn malformed_identity_short_circuits_before_lookup() {
        let lookup = lookup();
        let validator = Validator::<Tenant, _>::new(&lookup);
        let err = validator
            .resolve(Some(&header("abc")), &Principal::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedIdentity { .. }));
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn active_scope_resolves() {
        let lookup = lookup();
        let validator = Validator::<Tenant, _>::new(&lookup);
        let res = validator
            .resolve(Some(&header("2")), &Principal::Anonymous)
            .await
            .unwrap();
        assert_eq!(res.scope().unwrap().slug, "globex");
    }

    #[tokio::test]
    async fn inactive_and_unknown_scopes_are_rejected() {
        let lookup = lookup();
        let validator = Validator::<Tenant, _>::new(&lookup);
        for id in ["3", "99"] {
            let err = validator
                .resolve(Some(&header(id)), &Principal::Anonymous)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::UnknownOrInactiveScope { .. }), "{id}");
        }
    }

    #[tokio::test]
    async fn host_candidates_resolve_by_slug() {
        let lookup = lookup();
        let validator = Validator::<Tenant, _>::new(&lookup);
        let candidate = Candidate::new(CandidateSource::Host, "acme");
        let res = validator
            .resolve(Some(&candidate), &Principal::Anonymous)
            .await
            .unwrap();
        assert_eq!(res.scope().unwrap().id, 1);

        let bad = Candidate::new(CandidateSource::Host, "no");
        let err = validator
            .resolve(Some(&bad), &Principal::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownOrInactiveScope { .. }));
    }

    #[tokio::test]
    async fn affiliation_mismatch_wins_over_scope_validity() {
        let lookup = lookup();
        let validator = Validator::<Tenant, _>::new(&lookup);
        let principal = Principal::affiliated("alice", "1");

        let err = validator
            .resolve(Some(&header("2")), &principal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScopeMismatch { kind: "tenant" }));

        let err = validator
            .resolve(Some(&header("99")), &principal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScopeMismatch { .. }));

        let ok = validator
            .resolve(Some(&header("1")), &principal)
            .await
            .unwrap();
        assert_eq!(ok.scope().unwrap().id, 1);
    }

    #[tokio::test]
    async fn principal_without_affiliation_is_not_restricted() {
        let lookup = lookup();
        let validator = Validator::<Tenant, _>::new(&lookup);
        let res = validator
            .resolve(Some(&header("2")), &Principal::authenticated("bob"))
            .await
            .unwrap();
        assert_eq!(res.scope().unwrap().id, 2);
    }
}
