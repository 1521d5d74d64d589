use std::thread;

use lumodir::index_write::update_indices_for_attribute;
use lumodir::key::encode_attr_meta_key;
use lumodir::metadata::{get_all_attrs_metadata, get_attr_metadata};
use lumodir::uniqueness::validate_uniqueness;
use lumodir::value_metadata::get_attr_value_metadata;
use lumodir::{
    Attribute, AttributeMetadata, Backend, BackendConfig, BackendError, EnvFlags, Entry, Filter,
    IndexAccess, IndexDefinition, IndexOp, IndexTypes, IndexingStatus, SchemaLookup,
    ValueAttributeMetadata, ValueOpCode, ATTR_ATTR_META_DATA, ID,
};
use tempfile::TempDir;

fn open_backend(dir: &TempDir, indices: Vec<IndexDefinition>) -> Backend {
    let mut config = BackendConfig::new(dir.path()).with_env_flags(EnvFlags::NOSYNC);
    for def in indices {
        config = config.with_index(def);
    }
    Backend::open(config).unwrap()
}

fn mail_index() -> IndexDefinition {
    IndexDefinition::new("mail", IndexTypes::EQUALITY | IndexTypes::SUBSTR)
        .with_global_unique(true)
        .with_scope("cn=DSE Root")
}

fn uid_index(scopes: &[&str]) -> IndexDefinition {
    scopes
        .iter()
        .fold(IndexDefinition::new("uid", IndexTypes::EQUALITY), |def, scope| {
            def.with_scope(scope)
        })
}

/// Add entries in one committed transaction, returning their ids
fn add_all(backend: &Backend, entries: Vec<Entry>) -> Vec<ID> {
    let mut txn = backend.begin_txn().unwrap();
    let ids = entries
        .into_iter()
        .map(|mut entry| backend.add_entry(&mut txn, &mut entry).unwrap())
        .collect();
    txn.commit().unwrap();
    ids
}

fn try_add(backend: &Backend, mut entry: Entry) -> Result<ID, BackendError> {
    let mut txn = backend.begin_txn()?;
    let id = backend.add_entry(&mut txn, &mut entry)?;
    txn.commit()?;
    Ok(id)
}

fn search(backend: &Backend, filter: &Filter) -> Vec<ID> {
    let txn = backend.begin_ro_txn().unwrap();
    backend
        .search_candidates(&txn, filter)
        .unwrap()
        .as_slice()
        .to_vec()
}

fn tree(backend: &Backend) {
    add_all(
        backend,
        vec![
            Entry::new("dc=x"),
            Entry::new("ou=a,dc=x"),
            Entry::new("ou=b,dc=x"),
        ],
    );
}

#[test]
fn test_unique_mail_scenario() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![mail_index()]);
    tree(&backend);

    let a = try_add(
        &backend,
        Entry::new("cn=a,ou=a,dc=x").with_attribute("mail", &[b"x@y.com"]),
    )
    .unwrap();

    let err = try_add(
        &backend,
        Entry::new("cn=b,ou=b,dc=x").with_attribute("mail", &[b"X@Y.com"]),
    )
    .unwrap_err();
    assert!(matches!(err, BackendError::DataConstraintViolation { .. }));
    assert_eq!(err.ldap_result_code(), lumodir::ldap_result::CONSTRAINT_VIOLATION);

    let mut txn = backend.begin_txn().unwrap();
    backend.delete_entry(&mut txn, a).unwrap();
    txn.commit().unwrap();

    let b = try_add(
        &backend,
        Entry::new("cn=b,ou=b,dc=x").with_attribute("mail", &[b"x@y.com"]),
    )
    .unwrap();
    assert_eq!(search(&backend, &Filter::equality("mail", b"x@y.com")), vec![b]);
}

#[test]
fn test_uniqueness_within_one_scope() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![uid_index(&["dc=x"])]);
    tree(&backend);

    try_add(&backend, Entry::new("cn=1,ou=a,dc=x").with_attribute("uid", &[b"jdoe"])).unwrap();
    let err = try_add(&backend, Entry::new("cn=2,ou=b,dc=x").with_attribute("uid", &[b"jdoe"]))
        .unwrap_err();
    assert_eq!(
        err,
        BackendError::DataConstraintViolation {
            attr: "uid".to_string(),
            scope: "dc=x".to_string(),
        }
    );
}

#[test]
fn test_uniqueness_in_disjoint_scopes() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![uid_index(&["ou=a,dc=x", "ou=b,dc=x"])]);
    tree(&backend);

    let first =
        try_add(&backend, Entry::new("cn=1,ou=a,dc=x").with_attribute("uid", &[b"jdoe"])).unwrap();
    let second =
        try_add(&backend, Entry::new("cn=2,ou=b,dc=x").with_attribute("uid", &[b"jdoe"])).unwrap();
    // outside every scope
    let third = try_add(&backend, Entry::new("cn=3,dc=x").with_attribute("uid", &[b"jdoe"])).unwrap();

    assert!(matches!(
        try_add(&backend, Entry::new("cn=4,ou=a,dc=x").with_attribute("uid", &[b"jdoe"])),
        Err(BackendError::DataConstraintViolation { .. })
    ));
    assert_eq!(
        search(&backend, &Filter::equality("uid", b"JDOE")),
        vec![first, second, third]
    );
}

#[test]
fn test_update_and_delete_do_not_conflict() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![uid_index(&["dc=x"])]);
    tree(&backend);
    let ids = add_all(
        &backend,
        vec![
            Entry::new("cn=1,dc=x").with_attribute("uid", &[b"jdoe"]),
            Entry::new("cn=2,dc=x"),
        ],
    );

    let mut txn = backend.begin_txn().unwrap();
    let resolver = backend.resolver();

    // rewriting an entry's own value
    update_indices_for_attribute(
        &mut txn,
        backend.registry(),
        &resolver,
        "CN=1, DC=X",
        "uid",
        &[b"jdoe".to_vec()],
        ids[0],
        IndexOp::Update,
    )
    .unwrap();

    let cfg = backend.registry().acquire("uid", IndexAccess::Read).unwrap();
    validate_uniqueness(&txn, &cfg, &resolver, b"jdoe", "cn=2,dc=x", IndexOp::Delete).unwrap();
    assert!(matches!(
        validate_uniqueness(&txn, &cfg, &resolver, b"jdoe", "cn=2,dc=x", IndexOp::Create),
        Err(BackendError::DataConstraintViolation { .. })
    ));
    assert!(matches!(
        validate_uniqueness(&txn, &cfg, &resolver, b"", "cn=2,dc=x", IndexOp::Create),
        Err(BackendError::InvalidParameter(_))
    ));
}

#[test]
fn test_failed_index_update_rolls_back() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![uid_index(&["dc=x"])]);
    tree(&backend);
    let ids = add_all(
        &backend,
        vec![
            Entry::new("cn=1,dc=x").with_attribute("uid", &[b"taken"]),
            Entry::new("cn=2,dc=x"),
        ],
    );

    {
        let mut txn = backend.begin_txn().unwrap();
        let err = update_indices_for_attribute(
            &mut txn,
            backend.registry(),
            &backend.resolver(),
            "cn=2,dc=x",
            "uid",
            &[b"free".to_vec(), b"taken".to_vec(), b"other".to_vec()],
            ids[1],
            IndexOp::Create,
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::DataConstraintViolation { .. }));

        // the first value was written, the third never was
        let free = backend
            .search_candidates(&txn, &Filter::equality("uid", b"free"))
            .unwrap();
        assert_eq!(free.as_slice(), &[ids[1]]);
        let other = backend
            .search_candidates(&txn, &Filter::equality("uid", b"other"))
            .unwrap();
        assert!(other.is_empty());
        txn.abort();
    }

    assert!(search(&backend, &Filter::equality("uid", b"free")).is_empty());
    assert_eq!(search(&backend, &Filter::equality("uid", b"taken")), vec![ids[0]]);
}

#[test]
fn test_substring_searches() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(
        &dir,
        vec![IndexDefinition::new("mail", IndexTypes::EQUALITY | IndexTypes::SUBSTR)],
    );
    tree(&backend);
    let ids = add_all(
        &backend,
        vec![
            Entry::new("cn=1,dc=x").with_attribute("mail", &[b"alice@example.com"]),
            Entry::new("cn=2,dc=x").with_attribute("mail", &[b"bob@example.com", b"bob@other.org"]),
            Entry::new("cn=3,dc=x").with_attribute("mail", &[b"alice@other.org"]),
        ],
    );

    assert_eq!(
        search(&backend, &Filter::final_substring("mail", b"@Example.com")),
        vec![ids[0], ids[1]]
    );
    assert_eq!(
        search(&backend, &Filter::final_substring("mail", b"other.org")),
        vec![ids[1], ids[2]]
    );
    assert_eq!(
        search(&backend, &Filter::initial("mail", b"alice@")),
        vec![ids[0], ids[2]]
    );
    assert!(search(&backend, &Filter::final_substring("mail", b"nowhere.net")).is_empty());

    // uid has no index at all
    let txn = backend.begin_ro_txn().unwrap();
    assert!(backend
        .search_candidates(&txn, &Filter::equality("uid", b"x"))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_one_level_and_boolean_filters() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![IndexDefinition::new("sn", IndexTypes::EQUALITY)]);
    let tree_ids = add_all(
        &backend,
        vec![
            Entry::new("dc=x"),
            Entry::new("ou=a,dc=x"),
            Entry::new("ou=b,dc=x"),
        ],
    );
    let ids = add_all(
        &backend,
        vec![
            Entry::new("cn=1,ou=a,dc=x").with_attribute("sn", &[b"Smith"]),
            Entry::new("cn=2,ou=a,dc=x").with_attribute("sn", &[b"Jones"]),
            Entry::new("cn=3,ou=b,dc=x").with_attribute("sn", &[b"Smith"]),
        ],
    );

    assert_eq!(search(&backend, &Filter::one_level("")), vec![tree_ids[0]]);
    assert_eq!(
        search(&backend, &Filter::one_level("DC=X")),
        vec![tree_ids[1], tree_ids[2]]
    );
    assert_eq!(
        search(
            &backend,
            &Filter::And(vec![
                Filter::one_level("ou=a,dc=x"),
                Filter::equality("sn", b"smith"),
            ])
        ),
        vec![ids[0]]
    );
    assert_eq!(
        search(
            &backend,
            &Filter::Or(vec![
                Filter::equality("sn", b"jones"),
                Filter::one_level("ou=b,dc=x"),
            ])
        ),
        vec![ids[1], ids[2]]
    );

    let txn = backend.begin_ro_txn().unwrap();
    assert!(matches!(
        backend.search_candidates(&txn, &Filter::one_level("ou=missing,dc=x")),
        Err(BackendError::EntryNotFound(_))
    ));
}

#[test]
fn test_modify_attribute_reindexes() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![mail_index()]);
    tree(&backend);
    let ids = add_all(
        &backend,
        vec![Entry::new("cn=1,dc=x").with_attribute("mail", &[b"old@x.com", b"kept@x.com"])],
    );

    let mut txn = backend.begin_txn().unwrap();
    backend
        .modify_attribute(
            &mut txn,
            ids[0],
            Attribute::new("mail", vec![b"kept@x.com".to_vec(), b"new@x.com".to_vec()]),
        )
        .unwrap();
    txn.commit().unwrap();

    assert!(search(&backend, &Filter::equality("mail", b"old@x.com")).is_empty());
    assert_eq!(search(&backend, &Filter::equality("mail", b"kept@x.com")), vec![ids[0]]);
    assert_eq!(search(&backend, &Filter::equality("mail", b"new@x.com")), vec![ids[0]]);

    let txn = backend.begin_ro_txn().unwrap();
    let entry = backend.get_entry(&txn, ids[0]).unwrap();
    assert_eq!(entry.find_attribute("mail").unwrap().values.len(), 2);
    drop(txn);

    // a value held elsewhere is refused
    let other = add_all(&backend, vec![Entry::new("cn=2,dc=x")]);
    let mut txn = backend.begin_txn().unwrap();
    assert!(matches!(
        backend.modify_attribute(
            &mut txn,
            other[0],
            Attribute::new("mail", vec![b"new@x.com".to_vec()])
        ),
        Err(BackendError::DataConstraintViolation { .. })
    ));
}

#[test]
fn test_attribute_metadata_is_stored_verbatim() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![]);
    tree(&backend);

    let text = "1042:3:invoid-abc:20230101000000.000Z:998";
    let meta: AttributeMetadata = text.parse().unwrap();
    assert_eq!(meta, AttributeMetadata::new(1042, 3, "invoid-abc", "20230101000000.000Z", 998));

    let mut entry = Entry::new("cn=1,dc=x");
    entry
        .attrs
        .push(Attribute::new("cn", vec![b"1".to_vec()]).with_metadata(meta.clone()));
    let ids = add_all(&backend, vec![entry]);

    let cn = backend.schema().attr_id("cn").unwrap();
    let txn = backend.begin_ro_txn().unwrap();
    let stored = get_attr_metadata(&txn, backend.registry(), ids[0], cn).unwrap();
    assert_eq!(stored, meta);
    assert_eq!(stored.serialize().unwrap(), text);

    let cfg = backend
        .registry()
        .acquire(ATTR_ATTR_META_DATA, IndexAccess::Read)
        .unwrap();
    let raw = cfg
        .db()
        .get(&txn, &encode_attr_meta_key(ids[0], cn))
        .unwrap();
    assert_eq!(raw, Some(text.as_bytes()));

    let sn = backend.schema().attr_id("sn").unwrap();
    assert_eq!(
        get_attr_metadata(&txn, backend.registry(), ids[0], sn),
        Err(BackendError::AttrMetaDataNotFound {
            entry_id: ids[0],
            attr_id: sn,
        })
    );
}

#[test]
fn test_attribute_metadata_across_remove_and_readd() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![]);
    tree(&backend);

    let first: AttributeMetadata = "1:1:invo-1:20230101000000.000Z:1".parse().unwrap();
    let second: AttributeMetadata = "2:2:invo-2:20230102000000.000Z:2".parse().unwrap();
    let mut entry = Entry::new("cn=7,dc=x");
    entry
        .attrs
        .push(Attribute::new("cn", vec![b"7".to_vec()]).with_metadata(first.clone()));
    entry
        .attrs
        .push(Attribute::new("sn", vec![b"Doe".to_vec()]).with_metadata(first.clone()));
    let ids = add_all(&backend, vec![entry]);
    let sn = backend.schema().attr_id("sn").unwrap();

    let mut txn = backend.begin_txn().unwrap();
    backend
        .modify_attribute(&mut txn, ids[0], Attribute::new("sn", vec![]))
        .unwrap();
    assert_eq!(get_attr_metadata(&txn, backend.registry(), ids[0], sn).unwrap(), first);
    backend
        .modify_attribute(
            &mut txn,
            ids[0],
            Attribute::new("sn", vec![b"Roe".to_vec()]).with_metadata(second.clone()),
        )
        .unwrap();
    txn.commit().unwrap();

    {
        let txn = backend.begin_ro_txn().unwrap();
        assert_eq!(get_attr_metadata(&txn, backend.registry(), ids[0], sn).unwrap(), second);
        assert_eq!(get_all_attrs_metadata(&txn, backend.registry(), ids[0]).unwrap().len(), 2);
    }

    // the removed attribute's record outlives it until the entry goes
    let mut txn = backend.begin_txn().unwrap();
    backend
        .modify_attribute(&mut txn, ids[0], Attribute::new("sn", vec![]))
        .unwrap();
    backend.delete_entry(&mut txn, ids[0]).unwrap();
    txn.commit().unwrap();

    let txn = backend.begin_ro_txn().unwrap();
    assert!(get_all_attrs_metadata(&txn, backend.registry(), ids[0])
        .unwrap()
        .is_empty());
}

fn member_change(value: &[u8], time: &str, usn: i64) -> ValueAttributeMetadata {
    ValueAttributeMetadata {
        attr_type: "member".to_string(),
        local_usn: usn,
        version: 1,
        origin_invocation_id: "invo-1".to_string(),
        value_change_origin_invocation_id: "invo-1".to_string(),
        value_change_origin_time: time.to_string(),
        value_change_origin_usn: usn,
        op_code: ValueOpCode::Add,
        value: value.to_vec(),
    }
}

#[test]
fn test_value_metadata_keeps_latest_change() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![]);
    tree(&backend);

    let binary = b"cn=g:1\0,dc=x".to_vec();
    let mut attr = Attribute::new("member", vec![binary.clone(), b"cn=h,dc=x".to_vec()]);
    attr.value_metadata = vec![
        member_change(&binary, "20230101000000.000Z", 10),
        member_change(b"cn=h,dc=x", "20230101000000.000Z", 11),
    ];
    let mut entry = Entry::new("cn=grp,dc=x");
    entry.attrs.push(attr);
    let ids = add_all(&backend, vec![entry]);

    let member = backend.schema().attr_id("member").unwrap();
    let mut txn = backend.begin_txn().unwrap();
    let mut update = Attribute::new("member", vec![binary.clone(), b"cn=h,dc=x".to_vec()]);
    update.value_metadata = vec![member_change(&binary, "20230102000000.000Z", 20)];
    backend.modify_attribute(&mut txn, ids[0], update).unwrap();
    txn.commit().unwrap();

    let txn = backend.begin_ro_txn().unwrap();
    let records = get_attr_value_metadata(&txn, backend.registry(), ids[0], member).unwrap();
    assert_eq!(records.len(), 2);
    let latest = records.iter().find(|record| record.value == binary).unwrap();
    assert_eq!(latest.value_change_origin_usn, 20);
    drop(txn);

    let mut txn = backend.begin_txn().unwrap();
    backend.delete_entry(&mut txn, ids[0]).unwrap();
    txn.commit().unwrap();

    let txn = backend.begin_ro_txn().unwrap();
    assert!(get_attr_value_metadata(&txn, backend.registry(), ids[0], member)
        .unwrap()
        .is_empty());
}

#[test]
fn test_value_metadata_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let config = BackendConfig::new(dir.path())
        .with_env_flags(EnvFlags::NOSYNC)
        .with_concurrent_attr_value_update(false);
    let backend = Backend::open(config).unwrap();

    let mut attr = Attribute::new("member", vec![b"cn=h".to_vec()]);
    attr.value_metadata = vec![member_change(b"cn=h", "20230101000000.000Z", 1)];
    let mut entry = Entry::new("cn=grp");
    entry.attrs.push(attr);
    let ids = add_all(&backend, vec![entry]);

    let member = backend.schema().attr_id("member").unwrap();
    let txn = backend.begin_ro_txn().unwrap();
    assert!(get_attr_value_metadata(&txn, backend.registry(), ids[0], member)
        .unwrap()
        .is_empty());
}

#[test]
fn test_concurrent_writers_respect_uniqueness() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![mail_index()]);
    tree(&backend);

    let outcomes: Vec<bool> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let backend = &backend;
                s.spawn(move || {
                    let entry = Entry::new(&format!("cn=user{},ou=a,dc=x", i))
                        .with_attribute("mail", &[b"shared@x.com"]);
                    match try_add(backend, entry) {
                        Ok(_) => true,
                        Err(BackendError::DataConstraintViolation { .. }) => false,
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                })
            })
            .collect();

        // readers run alongside the writers
        for _ in 0..4 {
            let backend = &backend;
            s.spawn(move || {
                let found = search(backend, &Filter::equality("mail", b"shared@x.com"));
                assert!(found.len() <= 1);
            });
        }

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);
    assert_eq!(search(&backend, &Filter::equality("mail", b"shared@x.com")).len(), 1);
}

#[test]
fn test_scope_validation_lifecycle() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![uid_index(&[])]);
    tree(&backend);
    add_all(
        &backend,
        vec![
            Entry::new("cn=1,ou=a,dc=x").with_attribute("uid", &[b"dup"]),
            Entry::new("cn=2,ou=a,dc=x").with_attribute("uid", &[b"dup"]),
            Entry::new("cn=3,ou=b,dc=x").with_attribute("uid", &[b"solo"]),
        ],
    );
    let registry = backend.registry();

    // ou=a already holds a duplicate
    registry
        .begin_scope_validation("uid", vec!["ou=a,dc=x".to_string()])
        .unwrap();
    {
        let txn = backend.begin_ro_txn().unwrap();
        assert!(matches!(
            registry.validate_pending_scopes(&txn, "uid", &backend.resolver()),
            Err(BackendError::DataConstraintViolation { .. })
        ));
    }
    registry.abort_pending_scopes("uid").unwrap();
    let cfg = registry.acquire("uid", IndexAccess::Read).unwrap();
    assert_eq!(cfg.status(), IndexingStatus::Ready);
    assert!(cfg.scopes().committed.is_empty());

    registry
        .begin_scope_validation("uid", vec!["ou=b,dc=x".to_string()])
        .unwrap();
    assert_eq!(cfg.status(), IndexingStatus::ValidatingScopes);
    assert!(matches!(
        registry.begin_scope_validation("uid", vec!["dc=x".to_string()]),
        Err(BackendError::InvalidParameter(_))
    ));

    // staged scopes are enforced while they are validated
    assert!(matches!(
        try_add(&backend, Entry::new("cn=4,ou=b,dc=x").with_attribute("uid", &[b"solo"])),
        Err(BackendError::DataConstraintViolation { .. })
    ));

    {
        let txn = backend.begin_ro_txn().unwrap();
        registry
            .validate_pending_scopes(&txn, "uid", &backend.resolver())
            .unwrap();
    }
    registry.commit_pending_scopes("uid").unwrap();

    assert_eq!(cfg.status(), IndexingStatus::Ready);
    assert!(cfg.scopes().committed.contains("ou=b,dc=x"));
    assert!(try_add(&backend, Entry::new("cn=5,ou=b,dc=x").with_attribute("uid", &[b"solo"])).is_err());
    try_add(&backend, Entry::new("cn=6,ou=a,dc=x").with_attribute("uid", &[b"solo"])).unwrap();
}

#[test]
fn test_add_index_over_existing_entries() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![]);
    tree(&backend);
    let ids = add_all(
        &backend,
        vec![
            Entry::new("cn=1,dc=x").with_attribute("sn", &[b"Smith"]),
            Entry::new("cn=2,dc=x").with_attribute("sn", &[b"SMITH"]),
            Entry::new("cn=3,dc=x").with_attribute("sn", &[b"Jones"]),
        ],
    );

    {
        let txn = backend.begin_ro_txn().unwrap();
        assert!(backend
            .search_candidates(&txn, &Filter::equality("sn", b"smith"))
            .is_err());
    }

    backend
        .add_index(IndexDefinition::new("sn", IndexTypes::EQUALITY | IndexTypes::SUBSTR))
        .unwrap();
    assert_eq!(
        backend
            .registry()
            .acquire("sn", IndexAccess::Read)
            .unwrap()
            .status(),
        IndexingStatus::Ready
    );
    assert_eq!(search(&backend, &Filter::equality("sn", b"smith")), vec![ids[0], ids[1]]);
    assert_eq!(search(&backend, &Filter::final_substring("sn", b"nes")), vec![ids[2]]);

    // new entries are indexed as they are added
    let more = add_all(&backend, vec![Entry::new("cn=4,dc=x").with_attribute("sn", &[b"smith"])]);
    assert_eq!(
        search(&backend, &Filter::equality("sn", b"smith")),
        vec![ids[0], ids[1], more[0]]
    );
}

#[test]
fn test_add_index_refuses_configured_attribute() {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(&dir, vec![mail_index()]);
    tree(&backend);
    try_add(&backend, Entry::new("cn=1,dc=x").with_attribute("mail", &[b"a@x.com"])).unwrap();

    assert!(matches!(
        backend.add_index(mail_index()),
        Err(BackendError::InvalidParameter(_))
    ));
    assert!(matches!(
        backend.add_index(IndexDefinition::new("MAIL", IndexTypes::EQUALITY)),
        Err(BackendError::InvalidParameter(_))
    ));

    // the configured index keeps serving and enforcing
    let cfg = backend.registry().acquire("mail", IndexAccess::Read).unwrap();
    assert_eq!(cfg.status(), IndexingStatus::Ready);
    assert!(cfg.global_unique());
    drop(cfg);
    assert_eq!(search(&backend, &Filter::equality("mail", b"a@x.com")).len(), 1);
    assert!(matches!(
        try_add(&backend, Entry::new("cn=2,dc=x").with_attribute("mail", &[b"A@x.com"])),
        Err(BackendError::DataConstraintViolation { .. })
    ));
}

#[test]
fn test_backend_reopen() {
    let dir = TempDir::new().unwrap();
    let ids = {
        let backend = open_backend(&dir, vec![mail_index()]);
        tree(&backend);
        add_all(
            &backend,
            vec![Entry::new("cn=1,dc=x").with_attribute("mail", &[b"a@x.com"])],
        )
    };

    let backend = open_backend(&dir, vec![mail_index()]);
    let txn = backend.begin_ro_txn().unwrap();
    assert_eq!(backend.dn_to_entry_id(&txn, "cn=1,dc=x").unwrap(), ids[0]);
    let entry = backend.get_entry(&txn, ids[0]).unwrap();
    assert_eq!(entry.find_attribute("mail").unwrap().values, vec![b"a@x.com".to_vec()]);
    drop(txn);

    assert_eq!(search(&backend, &Filter::equality("mail", b"a@x.com")), ids);
    let next = add_all(&backend, vec![Entry::new("cn=2,dc=x")]);
    assert_eq!(next[0], ids[0] + 1);
    assert!(try_add(&backend, Entry::new("cn=3,dc=x").with_attribute("mail", &[b"a@x.com"])).is_err());
}
