/// Errors from evaluating a rule against one snapshot.
#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    /// The rule targets a pod that is absent from the snapshot.
    #[error("evaluator: pod '{pod}' not present in snapshot from {node}")]
    PodMissing { node: String, pod: String },

    /// The rule's target string is neither `node` nor `pod:<name>`.
    #[error("evaluator: unsupported target '{target}' for metric {metric}")]
    UnsupportedMetric { target: String, metric: String },

    #[error(transparent)]
    Store(#[from] podwatch_store::StoreError),
}

pub type Result<T> = std::result::Result<T, EvaluatorError>;
