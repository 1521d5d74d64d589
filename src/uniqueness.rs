//! Scoped uniqueness enforcement.
//!
//! A scope is a DN suffix, or the root sentinel `cn=DSE Root` which covers
//! every entry. A value may be held by at most one entry inside each enforced
//! scope.

use log::{debug, error, trace};
use std::collections::{BTreeMap, BTreeSet};

use crate::constants::PERSISTED_DSE_ROOT_DN;
use crate::cursor::Cursor;
use crate::entry_index::EntryResolver;
use crate::error::{BackendError, BackendResult, Error};
use crate::index_cfg::IndexConfig;
use crate::index_write::IndexOp;
use crate::key::{decode_entry_id, encode_forward_key};
use crate::log_bytes;
use crate::midl::ID;
use crate::schema::normalize_dn;
use crate::transaction::Transaction;

pub fn is_root_scope(scope: &str) -> bool {
    scope.trim().eq_ignore_ascii_case(PERSISTED_DSE_ROOT_DN)
}

/// True when `dn` is the scope itself or lies beneath it
pub fn dn_in_scope(dn: &str, scope: &str) -> bool {
    if is_root_scope(scope) {
        return true;
    }
    let dn = normalize_dn(dn);
    let scope = normalize_dn(scope);
    if scope.is_empty() {
        return false;
    }
    dn == scope
        || dn
            .strip_suffix(scope.as_str())
            .map_or(false, |head| head.ends_with(','))
}

pub fn dn_equal(a: &str, b: &str) -> bool {
    normalize_dn(a) == normalize_dn(b)
}

/// Entry ids stored under `value`'s forward key, in index order
fn holders(txn: &Transaction<'_>, cfg: &IndexConfig, value: &[u8]) -> BackendResult<Vec<ID>> {
    let cursor = Cursor::new(txn, &cfg.db())?;
    let key = encode_forward_key(value);

    let mut ids = Vec::new();
    for pair in cursor.iter_dup(&key)? {
        let (_, data) = pair?;
        ids.push(decode_entry_id(data).ok_or(Error::Corrupted)?);
    }
    Ok(ids)
}

/// Check that writing `value` for the entry at `entry_dn` keeps every
/// enforced scope unique.
///
/// The config's lock is held across the scan and the decision, so a
/// concurrent scope change cannot interleave with it. Scans read through
/// `txn`, which sees the caller's own uncommitted writes.
///
/// # Panics
///
/// Panics if the scan finds two different entries holding the value inside
/// one committed scope; that state cannot arise through this layer.
pub fn validate_uniqueness(
    txn: &Transaction<'_>,
    cfg: &IndexConfig,
    resolver: &dyn EntryResolver,
    value: &[u8],
    entry_dn: &str,
    op: IndexOp,
) -> BackendResult<()> {
    if value.is_empty() {
        return Err(BackendError::InvalidParameter(format!(
            "empty value for {}",
            cfg.attr_name()
        )));
    }

    if op == IndexOp::Delete {
        return Ok(());
    }

    let state = cfg.lock();
    let committed = &state.scopes.committed;
    let pending = state.scopes.effective_pending(state.status);
    if committed.is_empty() && pending.is_empty() {
        return Ok(());
    }

    // scope -> DN already holding the value
    let mut occupied: BTreeMap<&str, String> = BTreeMap::new();

    for entry_id in holders(txn, cfg, value)? {
        let found_dn = resolver.entry_id_to_dn(txn, entry_id)?;
        trace!(
            "{}={} held by entry {} ({})",
            cfg.attr_name(),
            log_bytes(value),
            entry_id,
            found_dn
        );

        for scope in committed.iter() {
            if !dn_in_scope(&found_dn, scope) {
                continue;
            }
            match occupied.get(scope.as_str()) {
                Some(prior) if !dn_equal(prior, &found_dn) => {
                    panic!(
                        "attribute {} value {} is held by both {} and {} in enforced scope {}",
                        cfg.attr_name(),
                        log_bytes(value),
                        prior,
                        found_dn,
                        scope
                    );
                }
                Some(_) => {}
                None => {
                    occupied.insert(scope.as_str(), found_dn.clone());
                }
            }
        }

        // staged scopes may already contain duplicates; validation reports those
        for scope in pending {
            if dn_in_scope(&found_dn, scope) && !occupied.contains_key(scope.as_str()) {
                occupied.insert(scope.as_str(), found_dn.clone());
            }
        }
    }

    for (scope, occupied_dn) in &occupied {
        if !dn_equal(entry_dn, occupied_dn) && dn_in_scope(entry_dn, scope) {
            error!(
                "uniqueness violation: {}={} for {} already held by {} in scope {}",
                cfg.attr_name(),
                log_bytes(value),
                entry_dn,
                occupied_dn,
                scope
            );
            return Err(BackendError::DataConstraintViolation {
                attr: cfg.attr_name().to_string(),
                scope: scope.to_string(),
            });
        }
    }

    Ok(())
}

/// Check every value already in the index against `scopes`
///
/// Used before staged scopes start being enforced.
pub fn check_existing_values(
    txn: &Transaction<'_>,
    cfg: &IndexConfig,
    resolver: &dyn EntryResolver,
    scopes: &[String],
) -> BackendResult<()> {
    let cursor = Cursor::new(txn, &cfg.db())?;
    let forward = encode_forward_key(&[]);

    let mut pair = cursor.set_range(&forward)?;
    while let Some((key, _)) = pair {
        if !key.starts_with(&forward) {
            break;
        }

        let mut in_scope: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        let mut current = pair;
        while let Some((_, data)) = current {
            let entry_id = decode_entry_id(data).ok_or(Error::Corrupted)?;
            let dn = normalize_dn(&resolver.entry_id_to_dn(txn, entry_id)?);
            for scope in scopes.iter().filter(|scope| dn_in_scope(&dn, scope)) {
                in_scope.entry(scope.as_str()).or_default().insert(dn.clone());
            }
            current = cursor.next_dup()?;
        }

        if let Some((scope, dns)) = in_scope.iter().find(|(_, dns)| dns.len() > 1) {
            error!(
                "scope {} of {} would hold {} entries with value {}",
                scope,
                cfg.attr_name(),
                dns.len(),
                log_bytes(&key[1..])
            );
            return Err(BackendError::DataConstraintViolation {
                attr: cfg.attr_name().to_string(),
                scope: scope.to_string(),
            });
        }

        pair = cursor.next_nodup()?;
    }

    debug!("{} staged scope(s) of {} hold unique values", scopes.len(), cfg.attr_name());
    Ok(())
}
