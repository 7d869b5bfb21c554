use std::error::Error;

/// Errors produced by caller-supplied sticky storage.
pub type StickyError = Box<dyn Error + Send + Sync>;

/// Persists traffic-assignment results so a subject keeps its variant
/// across evaluations.
///
/// Keys have the form `"{spec_id}-{subject_id}"`; values are the JSON form
/// `{"v": "<variant-id>"}`. The store is read before rule evaluation and
/// written after a successful evaluation that chose a variant. Read and
/// write errors surface from the evaluator because the contract promises
/// sticky durability.
pub trait StickyHandler: Send + Sync {
    /// Look up a cached assignment. `None` is a miss, not an error.
    fn get_sticky_result(&self, key: &str) -> Result<Option<String>, StickyError>;

    /// Persist an assignment.
    fn set_sticky_result(&self, key: &str, value: &str) -> Result<(), StickyError>;
}
