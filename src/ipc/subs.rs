use serde_json::{json, Map, Value};

/// Entity tables clients may watch, with the fields a subscription can
/// narrow on. The field lists mirror the declared SQL indexes, in
/// camelCase wire form.
pub fn indexed_fields(table: &str) -> Option<&'static [&'static str]> {
    match table {
        "representatives" => Some(&["cedula"]),
        "courses" => Some(&[]),
        "teachers" => Some(&["cedula", "tutorOfCourseId"]),
        "students" => Some(&["cedula", "courseId", "representativeId", "tutorId"]),
        "case_files" => Some(&["studentId", "status", "openingDate"]),
        "follow_ups" => Some(&["caseId", "date"]),
        "appointments" => Some(&["date", "studentId", "caseId"]),
        "preventive_activities" => Some(&["date"]),
        "pregnancy_cases" => Some(&["studentId", "detectionDate"]),
        _ => None,
    }
}

fn extract_keys(table: &str, row: &Value) -> Value {
    let mut keys = Map::new();
    if let Some(fields) = indexed_fields(table) {
        for f in fields {
            if let Some(v) = row.get(*f) {
                if !v.is_null() {
                    keys.insert((*f).to_string(), v.clone());
                }
            }
        }
    }
    Value::Object(keys)
}

/// One committed row write. Handlers collect these while a request
/// runs; the registry fans them out to matching subscriptions only
/// after the write succeeded.
#[derive(Debug, Clone)]
pub struct Change {
    pub table: &'static str,
    pub op: &'static str,
    pub row_id: String,
    pub keys: Value,
}

impl Change {
    pub fn insert(table: &'static str, row: &Value) -> Change {
        Change::from_row(table, "insert", row)
    }

    pub fn update(table: &'static str, row: &Value) -> Change {
        Change::from_row(table, "update", row)
    }

    /// `row` is the pre-delete snapshot, so key-narrowed subscriptions
    /// still see deletes of rows they were watching.
    pub fn delete(table: &'static str, row: &Value) -> Change {
        Change::from_row(table, "delete", row)
    }

    fn from_row(table: &'static str, op: &'static str, row: &Value) -> Change {
        let row_id = row
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Change {
            table,
            op,
            row_id,
            keys: extract_keys(table, row),
        }
    }
}

struct Subscription {
    seq: u64,
    id: String,
    table: String,
    key: Option<(String, Value)>,
}

#[derive(Default)]
pub struct SubRegistry {
    next_seq: u64,
    subs: Vec<Subscription>,
    pending: Vec<Value>,
}

impl SubRegistry {
    pub fn subscribe(&mut self, table: &str, key: Option<(String, Value)>) -> String {
        self.next_seq += 1;
        let id = format!("sub-{}", self.next_seq);
        self.subs.push(Subscription {
            seq: self.next_seq,
            id: id.clone(),
            table: table.to_string(),
            key,
        });
        id
    }

    pub fn unsubscribe(&mut self, id: &str) -> bool {
        let before = self.subs.len();
        self.subs.retain(|s| s.id != id);
        self.subs.len() != before
    }

    /// Queue event lines for every change/subscription pair that
    /// matches. Events for one change go out in subscription order.
    pub fn note_changes(&mut self, changes: Vec<Change>) {
        if self.subs.is_empty() {
            return;
        }
        for change in changes {
            let mut matched: Vec<&Subscription> = self
                .subs
                .iter()
                .filter(|s| s.table == change.table && key_matches(&s.key, &change.keys))
                .collect();
            matched.sort_by_key(|s| s.seq);
            for sub in matched {
                self.pending.push(json!({
                    "event": "store.changed",
                    "subscriptionId": sub.id,
                    "table": change.table,
                    "op": change.op,
                    "rowId": change.row_id,
                    "keys": change.keys,
                }));
            }
        }
    }

    pub fn drain_pending(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.pending)
    }
}

fn key_matches(key: &Option<(String, Value)>, keys: &Value) -> bool {
    match key {
        None => true,
        Some((field, value)) => keys.get(field) == Some(value),
    }
}
