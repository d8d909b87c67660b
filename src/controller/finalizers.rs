/// Finalizer that keeps a RemediationRequest until its node is uncordoned
pub const REMEDIATION_FINALIZER: &str = "remediation.self-fence.io/finalizer";
