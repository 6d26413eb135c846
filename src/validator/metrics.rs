//! Metrics-collection blocks against the metrics bundle contract.

use crate::catalog::MetricsContract;
use crate::descriptor::TestDescriptor;

/// True when every declared metrics-collection block supplies all mandatory
/// variables of `contract`. Stops at the first failing block.
///
/// A descriptor without metrics blocks always passes.
pub fn validate_metrics_collection_process(
    descriptor: &TestDescriptor,
    contract: &MetricsContract,
) -> bool {
    let mandatory: Vec<&str> = contract.mandatory_names().collect();
    for block in descriptor.metrics_collection() {
        let missing = mandatory
            .iter()
            .find(|name| !block.parameters.iter().any(|p| p.key == **name));
        if let Some(name) = missing {
            tracing::debug!(
                metrics_collection_id = block.metrics_collection_id,
                variable = %name,
                "metrics collection block is missing a mandatory variable"
            );
            return false;
        }
    }
    true
}
