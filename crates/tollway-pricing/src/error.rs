/// Pricing source failures
#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    /// The backing price table could not be read
    #[error("failed to load price table: {0}")]
    Source(String),
}
