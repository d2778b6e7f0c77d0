//! Engine-level tests over the in-memory collaborators.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use formrow_core::{
  StoreError,
  dedup::{DedupMessage, DedupRuleConfig, KeyedDedupEvaluator},
  form::{Form, FormConfig},
  listing::{BatchRequest, ListItem, ListRequest},
  page::decode_page_token,
  record::{FieldValue, MaintenanceStage, SaveMode, SaveRequest, Values, WriteOrigin},
  store::{Cell, PropertyStore, Row, TabularStore},
};

use crate::{
  Collaborators, Engine, EngineOptions, Error, ReconcileMode,
  index::index_table_name,
  layout::{COL_DATA_VERSION, COL_ID, META_WIDTH},
  memory::{MemoryProperties, MemoryTables},
};

const TABLE: &str = "Lunch Orders";

// ─── Fixtures ────────────────────────────────────────────────────────────────

/// Memory tables whose index writes can be made to fail.
#[derive(Default)]
struct FlakyIndexTables {
  inner:      MemoryTables,
  fail_index: AtomicBool,
}

impl FlakyIndexTables {
  fn set_failing(&self, failing: bool) { self.fail_index.store(failing, Ordering::SeqCst); }
}

impl TabularStore for FlakyIndexTables {
  fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
    self.inner.table_exists(table)
  }

  fn create_table(&self, table: &str, header: &[Cell]) -> Result<(), StoreError> {
    self.inner.create_table(table, header)
  }

  fn row_count(&self, table: &str) -> Result<usize, StoreError> { self.inner.row_count(table) }

  fn col_count(&self, table: &str) -> Result<usize, StoreError> { self.inner.col_count(table) }

  fn get_range(
    &self,
    table: &str,
    row: usize,
    col: usize,
    height: usize,
    width: usize,
  ) -> Result<Vec<Row>, StoreError> {
    self.inner.get_range(table, row, col, height, width)
  }

  fn set_range(&self, table: &str, row: usize, col: usize, values: &[Row]) -> Result<(), StoreError> {
    if self.fail_index.load(Ordering::SeqCst) && table.ends_with("__index") {
      return Err(StoreError::Unavailable("index table offline".into()));
    }
    self.inner.set_range(table, row, col, values)
  }

  fn append_row(&self, table: &str, values: &[Cell]) -> Result<usize, StoreError> {
    self.inner.append_row(table, values)
  }
}

fn form() -> Form {
  Form::try_from(FormConfig {
    form_key:    "lunch".into(),
    destination: TABLE.into(),
    fields:      vec!["NAME".into(), "DISH".into(), "EMAIL".into()],
    dedup_rules: vec![DedupRuleConfig {
      id: "one-per-email".into(),
      keys: vec!["EMAIL".into()],
      message: Some(DedupMessage::Plain("You already ordered lunch.".into())),
      ..Default::default()
    }],
  })
  .unwrap()
}

fn engine_over(tables: Arc<dyn TabularStore>, options: EngineOptions) -> Engine {
  let collaborators = Collaborators { tables, ..Collaborators::in_memory() };
  Engine::new(
    collaborators,
    Arc::new(KeyedDedupEvaluator),
    options,
  )
}

fn setup() -> (Engine, Arc<MemoryTables>, Form) {
  let tables = Arc::new(MemoryTables::default());
  (engine_over(tables.clone(), EngineOptions::default()), tables, form())
}

fn values(pairs: &[(&str, &str)]) -> Values {
  pairs
    .iter()
    .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
    .collect()
}

fn order(name: &str, email: &str) -> SaveRequest {
  SaveRequest::new("lunch", values(&[("NAME", name), ("DISH", "Soup"), ("EMAIL", email)]))
}

fn text(record_values: &Values, field: &str) -> Option<String> {
  match record_values.get(field) {
    Some(FieldValue::Text(s)) => Some(s.clone()),
    _ => None,
  }
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn new_record_starts_at_version_one_and_reads_back() {
  let (engine, _, form) = setup();
  let receipt = engine
    .submissions()
    .save(&form, SaveRequest::new("lunch", values(&[("DISH", "Soup")])))
    .unwrap();
  assert!(receipt.created);
  assert_eq!(receipt.meta().data_version, 1);
  assert!(receipt.warnings.is_empty());

  let fetched = engine.listing().fetch_by_id(&form, &receipt.record.id).unwrap().unwrap();
  assert_eq!(text(&fetched.values, "DISH").as_deref(), Some("Soup"));
  assert_eq!(fetched.data_version, 1);
}

#[test]
fn stale_observed_version_is_rejected() {
  let (engine, _, form) = setup();
  let id = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap().record.id;

  let second = engine
    .submissions()
    .save(&form, order("Ada", "ada@x").with_record_id(&id).with_observed_version(1))
    .unwrap();
  assert_eq!(second.record.data_version, 2);

  let err = engine
    .submissions()
    .save(&form, order("Ada L.", "ada@x").with_record_id(&id).with_observed_version(1))
    .unwrap_err();
  assert!(matches!(err, Error::StaleWrite { stored: 2, observed: 1, .. }));
  assert_eq!(err.record_id(), Some(id.as_str()));

  let stored = engine.listing().fetch_by_id(&form, &id).unwrap().unwrap();
  assert_eq!(text(&stored.values, "NAME").as_deref(), Some("Ada"));
}

#[test]
fn duplicate_signature_is_rejected_with_rule_message() {
  let (engine, _, form) = setup();
  let first = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();

  let err = engine.submissions().save(&form, order("Someone", "ada@x")).unwrap_err();
  match &err {
    Error::Duplicate { rule_id, message, existing_record_id, .. } => {
      assert_eq!(rule_id, "one-per-email");
      assert_eq!(message, "You already ordered lunch.");
      assert_eq!(existing_record_id, &first.record.id);
    }
    other => panic!("expected duplicate, got {other:?}"),
  }
  let response = err.to_response();
  assert!(!response.success);
  assert_eq!(response.message, "You already ordered lunch.");
}

#[test]
fn pages_walk_the_table_with_tokens() {
  let (engine, _, form) = setup();
  for i in 0..5 {
    engine
      .submissions()
      .save(&form, order(&format!("p{i}"), &format!("p{i}@x")))
      .unwrap();
  }

  let mut request = ListRequest { page_size: 2, hydrate: true, ..Default::default() };
  let first = engine.listing().fetch_page(&form, &request).unwrap();
  assert_eq!(first.items.len(), 2);
  assert_eq!(first.total_count, 5);
  let token = first.next_page_token.clone().unwrap();
  assert_eq!(decode_page_token(Some(&token)).unwrap(), 2);

  request.page_token = Some(token);
  let second = engine.listing().fetch_page(&form, &request).unwrap();
  assert_eq!(second.items.len(), 2);
  assert_eq!(second.items[0].row_number(), 4);

  request.page_token = second.next_page_token.clone();
  let third = engine.listing().fetch_page(&form, &request).unwrap();
  assert_eq!(third.items.len(), 1);
  assert!(third.next_page_token.is_none());
}

#[test]
fn legacy_row_gets_an_id_when_fetched_by_row() {
  let (engine, tables, form) = setup();
  engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();

  let mut legacy = vec![String::new(); META_WIDTH];
  legacy.extend(["Bob".to_string(), "Pie".to_string(), String::new()]);
  let row = tables.append_row(TABLE, &legacy).unwrap();
  let etag_before = engine.listing().fetch_page(&form, &ListRequest::default()).unwrap().etag;

  let hydrated = engine.listing().fetch_by_row_number(&form, row).unwrap().unwrap();
  assert_eq!(hydrated.row_number, row);
  assert_eq!(hydrated.record.data_version, 1);
  assert_eq!(text(&hydrated.record.values, "DISH").as_deref(), Some("Pie"));

  let stored_id = tables.get_range(TABLE, row, COL_ID, 1, 1).unwrap();
  assert_eq!(stored_id[0][0], hydrated.record.id);

  let by_id = engine.listing().fetch_by_id(&form, &hydrated.record.id).unwrap().unwrap();
  assert_eq!(by_id.id, hydrated.record.id);

  let etag_after = engine.listing().fetch_page(&form, &ListRequest::default()).unwrap().etag;
  assert_ne!(etag_before, etag_after);
}

// ─── Properties ──────────────────────────────────────────────────────────────

#[test]
fn concurrent_writers_on_one_version_produce_one_winner() {
  let (engine, _, form) = setup();
  let id = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap().record.id;

  let outcomes: Vec<_> = std::thread::scope(|s| {
    let handles: Vec<_> = (0..6)
      .map(|i| {
        let engine = engine.clone();
        let form = &form;
        let id = id.clone();
        s.spawn(move || {
          let request = SaveRequest::new("lunch", values(&[("DISH", format!("dish {i}").as_str())]))
            .with_record_id(id)
            .with_observed_version(1);
          engine.submissions().save(form, request)
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  let winners: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
  assert_eq!(winners.len(), 1);
  assert_eq!(winners[0].record.data_version, 2);
  assert!(
    outcomes
      .iter()
      .filter_map(|o| o.as_ref().err())
      .all(|e| matches!(e, Error::StaleWrite { .. }))
  );
}

#[test]
fn versions_advance_by_exactly_one_per_write() {
  let (engine, _, form) = setup();
  let mut receipt = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();
  for expected in 2..=5 {
    receipt = engine
      .submissions()
      .save(&form, order("Ada", "ada@x").with_record_id(&receipt.record.id))
      .unwrap();
    assert_eq!(receipt.record.data_version, expected);
  }
}

#[test]
fn etag_is_stable_until_a_write() {
  let (engine, _, form) = setup();
  engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();

  let list = ListRequest::default();
  let a = engine.listing().fetch_page(&form, &list).unwrap().etag;
  let b = engine.listing().fetch_page(&form, &list).unwrap().etag;
  assert_eq!(a, b);

  engine.submissions().save(&form, order("Bea", "bea@x")).unwrap();
  let c = engine.listing().fetch_page(&form, &list).unwrap();
  assert_ne!(a, c.etag);
  assert_eq!(c.total_count, 2);
}

#[test]
fn same_record_may_keep_its_own_signature() {
  let (engine, _, form) = setup();
  let id = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap().record.id;
  let again = engine
    .submissions()
    .save(&form, order("Ada Lovelace", "ada@x").with_record_id(&id))
    .unwrap();
  assert_eq!(again.record.data_version, 2);
}

#[test]
fn drafts_do_not_block_final_submissions() {
  let (engine, _, form) = setup();
  let mut draft = order("Ada", "ada@x");
  draft.save_mode = SaveMode::Draft;
  let draft = engine.submissions().save(&form, draft).unwrap();
  assert_eq!(draft.record.status, "Draft");

  let first_final = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();
  assert_eq!(first_final.record.status, "Submitted");

  let err = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap_err();
  assert!(matches!(err, Error::Duplicate { .. }));
}

#[test]
fn unbuilt_index_fails_dedup_governed_saves_closed() {
  let tables = Arc::new(FlakyIndexTables::default());
  let engine = engine_over(tables.clone(), EngineOptions::default());
  let form = form();

  tables.set_failing(true);
  let saved = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();
  assert!(!saved.warnings.is_empty(), "index failure is reported, not raised");
  tables.set_failing(false);

  let err = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap_err();
  assert!(matches!(err, Error::IndexNotBuilt { .. }));

  let report = engine.reconciler().rebuild_index(&form).unwrap();
  assert_eq!(report.rows, 1);
  assert_eq!(report.versions_advanced, 0);

  let err = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap_err();
  assert!(matches!(err, Error::Duplicate { .. }));
}

#[test]
fn legacy_rows_block_dedup_until_reconciled() {
  let (engine, tables, form) = setup();
  engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();
  let mut legacy = vec![String::new(); META_WIDTH];
  legacy.extend(["Bob".to_string(), "Pie".to_string(), "bob@x".to_string()]);
  let row = tables.append_row(TABLE, &legacy).unwrap();

  let err = engine.submissions().save(&form, order("Bob", "bob@x")).unwrap_err();
  assert!(matches!(err, Error::IndexNotBuilt { .. }));

  engine.reconciler().reconcile_rows(&form, row, 1, ReconcileMode::RebuildOnly).unwrap();
  let err = engine.submissions().save(&form, order("Bob", "bob@x")).unwrap_err();
  assert!(matches!(err, Error::Duplicate { .. }));
}

#[test]
fn index_stays_aligned_with_the_main_table() {
  let (engine, tables, form) = setup();
  let mut ids = Vec::new();
  for i in 0..6 {
    ids.push(
      engine
        .submissions()
        .save(&form, order(&format!("p{i}"), &format!("p{i}@x")))
        .unwrap()
        .record
        .id,
    );
  }
  for id in ids.iter().step_by(2) {
    engine
      .submissions()
      .save(&form, SaveRequest::new("lunch", values(&[("DISH", "Stew")])).with_record_id(id))
      .unwrap();
  }

  let rows = tables.row_count(TABLE).unwrap();
  let main = tables.get_range(TABLE, 2, COL_ID, rows - 1, 1).unwrap();
  let index = tables.get_range(&index_table_name(TABLE), 2, 1, rows - 1, 1).unwrap();
  assert_eq!(main, index);
}

#[test]
fn reads_after_writes_see_the_write() {
  let (engine, _, form) = setup();
  let id = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap().record.id;
  assert_eq!(engine.listing().fetch_by_id(&form, &id).unwrap().unwrap().data_version, 1);

  engine
    .submissions()
    .save(&form, SaveRequest::new("lunch", values(&[("DISH", "Stew")])).with_record_id(&id))
    .unwrap();
  let fresh = engine.listing().fetch_by_id(&form, &id).unwrap().unwrap();
  assert_eq!(fresh.data_version, 2);
  assert_eq!(text(&fresh.values, "DISH").as_deref(), Some("Stew"));

  let page = engine
    .listing()
    .fetch_page(&form, &ListRequest { hydrate: true, ..Default::default() })
    .unwrap();
  match &page.items[0] {
    ListItem::Hydrated(row) => assert_eq!(row.record.data_version, 2),
    other => panic!("expected hydrated row, got {other:?}"),
  }
}

#[test]
fn background_writes_to_closed_records_are_refused() {
  let (engine, _, form) = setup();
  let mut closing = order("Ada", "ada@x");
  closing.status_override = Some("Closed".into());
  let id = engine.submissions().save(&form, closing).unwrap().record.id;

  let mut background = order("Ada", "ada@x").with_record_id(&id);
  background.origin = WriteOrigin::Background;
  let err = engine.submissions().save(&form, background.clone()).unwrap_err();
  assert!(matches!(err, Error::ClosedRecord { .. }));
  assert_eq!(engine.listing().fetch_by_id(&form, &id).unwrap().unwrap().data_version, 1);

  background.allow_closed = true;
  assert!(engine.submissions().save(&form, background).is_ok());

  let interactive = order("Ada", "ada@x").with_record_id(&id);
  assert!(engine.submissions().save(&form, interactive).is_ok());
}

#[test]
fn client_supplied_id_creates_the_record() {
  let (engine, _, form) = setup();
  let receipt = engine
    .submissions()
    .save(&form, order("Ada", "ada@x").with_record_id("order-17"))
    .unwrap();
  assert!(receipt.created);
  assert_eq!(receipt.record.id, "order-17");
  assert!(engine.listing().fetch_by_id(&form, "order-17").unwrap().is_some());
}

// ─── Listing ─────────────────────────────────────────────────────────────────

#[test]
fn projection_reads_only_requested_fields() {
  let (engine, _, form) = setup();
  let id = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap().record.id;

  let request = ListRequest {
    projection: vec!["DISH".into(), "Status".into()],
    ..Default::default()
  };
  let page = engine.listing().fetch_page(&form, &request).unwrap();
  match &page.items[0] {
    ListItem::Projected(row) => {
      assert_eq!(row.id.as_deref(), Some(id.as_str()));
      assert_eq!(row.values.keys().collect::<Vec<_>>(), ["DISH", "Status"]);
    }
    other => panic!("expected projected row, got {other:?}"),
  }

  let bad = ListRequest { projection: vec!["PHONE".into()], ..Default::default() };
  assert!(matches!(
    engine.listing().fetch_page(&form, &bad),
    Err(Error::UnknownField { .. })
  ));
}

#[test]
fn paging_stops_at_the_scan_limit() {
  let tables = Arc::new(MemoryTables::default());
  let options = EngineOptions { max_scan_rows: 3, ..Default::default() };
  let engine = engine_over(tables, options);
  let form = form();
  for i in 0..5 {
    engine
      .submissions()
      .save(&form, order(&format!("p{i}"), &format!("p{i}@x")))
      .unwrap();
  }

  let request = ListRequest { page_size: 2, ..Default::default() };
  let first = engine.listing().fetch_page(&form, &request).unwrap();
  let second = engine
    .listing()
    .fetch_page(&form, &ListRequest { page_token: first.next_page_token, ..request })
    .unwrap();
  assert_eq!(second.items.len(), 1);
  assert!(second.next_page_token.is_none());
  assert_eq!(second.total_count, 5);
}

#[test]
fn missing_table_lists_as_empty() {
  let (engine, _, form) = setup();
  let page = engine.listing().fetch_page(&form, &ListRequest::default()).unwrap();
  assert!(page.items.is_empty());
  assert_eq!(page.total_count, 0);
  assert!(engine.listing().fetch_by_id(&form, "nope").unwrap().is_none());
}

#[test]
fn malformed_page_token_is_rejected() {
  let (engine, _, form) = setup();
  let request = ListRequest { page_token: Some("!!".into()), ..Default::default() };
  assert!(matches!(
    engine.listing().fetch_page(&form, &request),
    Err(Error::InvalidPageToken(_))
  ));
}

#[test]
fn batch_returns_extras_and_missing_ids() {
  let (engine, _, form) = setup();
  let ids: Vec<String> = (0..4)
    .map(|i| {
      engine
        .submissions()
        .save(&form, order(&format!("p{i}"), &format!("p{i}@x")))
        .unwrap()
        .record
        .id
    })
    .collect();

  let request = BatchRequest {
    list: ListRequest { page_size: 2, ..Default::default() },
    ids:  vec![ids[0].clone(), ids[3].clone(), "nope".into()],
  };
  let batch = engine.listing().fetch_batch(&form, &request).unwrap();
  assert_eq!(batch.page.items.len(), 2);
  assert_eq!(batch.extras.keys().collect::<Vec<_>>(), [&ids[3]]);
  assert_eq!(batch.missing, ["nope"]);
}

// ─── Reconciliation ──────────────────────────────────────────────────────────

#[test]
fn edited_rows_advance_their_version() {
  let (engine, tables, form) = setup();
  let id = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap().record.id;
  assert!(engine.listing().fetch_by_id(&form, &id).unwrap().is_some());

  // DISH is the second field column.
  tables.set_range(TABLE, 2, META_WIDTH + 2, &[vec!["Curry".to_string()]]).unwrap();
  let report = engine.reconciler().reconcile_rows(&form, 2, 1, ReconcileMode::Edited).unwrap();
  assert_eq!(report.versions_advanced, 1);
  assert_eq!(report.index_rows_written, 1);
  assert!(report.etag.is_some());

  let fresh = engine.listing().fetch_by_id(&form, &id).unwrap().unwrap();
  assert_eq!(fresh.data_version, 2);
  assert_eq!(text(&fresh.values, "DISH").as_deref(), Some("Curry"));
}

#[test]
fn edited_version_passes_the_larger_of_table_and_index() {
  let (engine, tables, form) = setup();
  engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();
  // Someone overwrote the version cell with an older value.
  tables.set_range(TABLE, 2, COL_DATA_VERSION, &[vec!["0".to_string()]]).unwrap();

  engine.reconciler().reconcile_rows(&form, 2, 1, ReconcileMode::Edited).unwrap();
  let version = tables.get_range(TABLE, 2, COL_DATA_VERSION, 1, 1).unwrap();
  assert_eq!(version[0][0], "2");
}

#[test]
fn rebuild_clears_index_rows_past_the_table() {
  let (engine, tables, form) = setup();
  engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();
  let index = index_table_name(TABLE);
  tables.set_range(&index, 5, 1, &[vec!["ghost".to_string()]]).unwrap();

  let report = engine.reconciler().rebuild_index(&form).unwrap();
  assert_eq!(report.stale_index_rows_cleared, 3);
  assert_eq!(tables.get_range(&index, 5, 1, 1, 1).unwrap()[0][0], "");
}

#[test]
fn reconcile_rejects_the_header_row() {
  let (engine, _, form) = setup();
  engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();
  assert!(matches!(
    engine.reconciler().reconcile_rows(&form, 1, 1, ReconcileMode::Edited),
    Err(Error::InvalidRequest(_))
  ));
}

// ─── Maintenance failures ────────────────────────────────────────────────────

/// Memory properties whose writes can be made to fail.
#[derive(Default)]
struct FlakyProperties {
  inner:     MemoryProperties,
  fail_sets: AtomicBool,
}

impl FlakyProperties {
  fn set_failing(&self, failing: bool) { self.fail_sets.store(failing, Ordering::SeqCst); }
}

impl PropertyStore for FlakyProperties {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> { self.inner.get(key) }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    if self.fail_sets.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("quota".into()));
    }
    self.inner.set(key, value)
  }
}

fn hydrated_version(item: &ListItem) -> Option<u64> {
  match item {
    ListItem::Hydrated(h) => Some(h.record.data_version),
    ListItem::Projected(_) => None,
  }
}

#[test]
fn unpersisted_etag_bump_does_not_serve_cached_reads() {
  let properties = Arc::new(FlakyProperties::default());
  let collaborators = Collaborators { properties: properties.clone(), ..Collaborators::in_memory() };
  let engine = Engine::new(collaborators, Arc::new(KeyedDedupEvaluator), EngineOptions::default());
  let form = form();

  let hydrated = ListRequest { hydrate: true, ..Default::default() };

  let id = engine.submissions().save(&form, order("Ada", "ada@x")).unwrap().record.id;
  assert_eq!(engine.listing().fetch_by_id(&form, &id).unwrap().unwrap().data_version, 1);
  let page = engine.listing().fetch_page(&form, &hydrated).unwrap();
  assert_eq!(hydrated_version(&page.items[0]), Some(1));

  properties.set_failing(true);
  let receipt = engine
    .submissions()
    .save(&form, order("Ada L.", "ada@x").with_record_id(&id).with_observed_version(1))
    .unwrap();
  assert_eq!(receipt.record.data_version, 2);
  assert!(receipt.etag.is_none());
  assert!(receipt.warnings.iter().any(|w| w.stage == MaintenanceStage::Cache));

  let read = engine.listing().fetch_by_id(&form, &id).unwrap().unwrap();
  assert_eq!(read.data_version, 2);
  let page = engine.listing().fetch_page(&form, &hydrated).unwrap();
  assert_eq!(hydrated_version(&page.items[0]), Some(2));

  // The version just read is accepted, with or without the property store.
  let third = engine
    .submissions()
    .save(&form, order("Ada Lovelace", "ada@x").with_record_id(&id).with_observed_version(2))
    .unwrap();
  assert_eq!(third.record.data_version, 3);

  properties.set_failing(false);
  assert_eq!(engine.listing().fetch_by_id(&form, &id).unwrap().unwrap().data_version, 3);
  let etag = engine.listing().fetch_page(&form, &hydrated).unwrap().etag;
  assert!(!etag.starts_with("fp-"), "recovers a persisted etag once writes succeed");
}

#[test]
fn typed_values_read_the_same_hot_and_cold() {
  let (engine, _, form) = setup();
  let mut request = order("Ada", "ada@x");
  request.values.insert("DISH".into(), FieldValue::Number(3.0));
  request.values.insert("NAME".into(), FieldValue::Bool(true));
  let receipt = engine.submissions().save(&form, request).unwrap();
  let id = receipt.record.id.clone();

  let hot = engine.listing().fetch_by_id(&form, &id).unwrap().unwrap();
  engine.cache().invalidate_all("test").unwrap();
  let cold = engine.listing().fetch_by_id(&form, &id).unwrap().unwrap();

  assert_eq!(hot, cold);
  assert_eq!(receipt.record, cold);
  assert_eq!(cold.values.get("DISH"), Some(&FieldValue::Text("3".into())));
  assert_eq!(cold.values.get("NAME"), Some(&FieldValue::Text("true".into())));
}

#[test]
fn legacy_row_fetch_survives_a_failing_index() {
  let tables = Arc::new(FlakyIndexTables::default());
  let engine = engine_over(tables.clone(), EngineOptions::default());
  let form = form();
  engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();

  let mut legacy = vec![String::new(); META_WIDTH];
  legacy.extend(["Bob".to_string(), "Pie".to_string(), String::new()]);
  let row = tables.append_row(TABLE, &legacy).unwrap();

  tables.set_failing(true);
  let hydrated = engine.listing().fetch_by_row_number(&form, row).unwrap().unwrap();
  let stored_id = tables.get_range(TABLE, row, COL_ID, 1, 1).unwrap();
  assert_eq!(stored_id[0][0], hydrated.record.id);

  let report = engine.reconciler().reconcile_rows(&form, row, 1, ReconcileMode::Edited).unwrap();
  assert_eq!(report.index_rows_written, 0);
  assert!(report.warnings.iter().any(|w| w.stage == MaintenanceStage::Index));
  assert!(report.etag.is_some());

  tables.set_failing(false);
  let report = engine.reconciler().rebuild_index(&form).unwrap();
  assert!(report.warnings.is_empty());
  assert_eq!(report.index_rows_written, 2);
}

#[test]
fn stale_index_signature_fails_closed_until_reconciled() {
  let (engine, tables, form) = setup();
  engine.submissions().save(&form, order("Ada", "ada@x")).unwrap();
  // EMAIL is the third field column; the index still holds the old signature.
  tables.set_range(TABLE, 2, META_WIDTH + 3, &[vec!["ada@y".to_string()]]).unwrap();

  let err = engine.submissions().save(&form, order("Eve", "ada@x")).unwrap_err();
  assert!(matches!(err, Error::IndexNotBuilt { .. }));

  engine.reconciler().reconcile_rows(&form, 2, 1, ReconcileMode::Edited).unwrap();
  engine.submissions().save(&form, order("Eve", "ada@x")).unwrap();
  let err = engine.submissions().save(&form, order("Ada", "ada@y")).unwrap_err();
  assert!(matches!(err, Error::Duplicate { .. }));
}
