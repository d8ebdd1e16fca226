use std::sync::Arc;

use fwd_core::{completion::CompletionService, config::Config};
use fwd_openai::OpenAiCompletion;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<(), fwd_core::Error> {
    fwd_core::logging::init("fwd")?;

    let cfg = Arc::new(Config::load()?);

    let completion: Option<Arc<dyn CompletionService>> = match OpenAiCompletion::from_config(&cfg)? {
        Some(client) => Some(Arc::new(client)),
        None => {
            warn!("OPENAI_API_KEY not set, reports will be plain listings");
            None
        }
    };

    fwd_telegram::router::run_polling(cfg, completion)
        .await
        .map_err(|e| fwd_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
