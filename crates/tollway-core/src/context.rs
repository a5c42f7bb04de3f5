/// Authenticated caller resolved from an API key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Ledger owner charged for the request
    pub user_id: String,
    /// Identifier of the API key that authenticated the request
    pub api_key_id: String,
    /// Lowercased model names this key may call, empty for no restriction
    pub allowed_models: Vec<String>,
}

impl CallerIdentity {
    /// Check the per-key model restriction (case-insensitive)
    pub fn allows_model(&self, model: &str) -> bool {
        if self.allowed_models.is_empty() {
            return true;
        }

        let model = model.to_lowercase();
        self.allowed_models.iter().any(|allowed| *allowed == model)
    }
}
