use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tracing::{error, info, warn};

use fwd_core::{
    completion::CompletionService,
    config::Config,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    service::ForwardService,
    source::SourceNetwork,
    store::SubscriptionStore,
};

use crate::{handlers, BotApiSource, TelegramMessenger};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub service: ForwardService,
    pub source: Arc<BotApiSource>,
}

pub async fn run_polling(
    cfg: Arc<Config>,
    completion: Option<Arc<dyn CompletionService>>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    info!(
        subscriptions = %cfg.subscriptions_file.display(),
        allowed_users = cfg.telegram_allowed_users.len(),
        report_interval_secs = cfg.report_interval.as_secs(),
        completion = completion.is_some(),
        "starting forwarder"
    );

    // Throttle outbound sends to stay clear of flood limits; RetryAfter is
    // still honored by the dispatch retry loop.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));
    let source = Arc::new(BotApiSource::new(bot.clone()));

    let store = SubscriptionStore::open(&cfg.subscriptions_file)?;
    let service = ForwardService::new(
        cfg.clone(),
        store,
        source.clone() as Arc<dyn SourceNetwork>,
        messenger,
        completion,
    );

    // Commands are served while stored rules are being restored.
    {
        let service = service.clone();
        tokio::spawn(async move {
            let Some(report) = service.recover_until_connected().await else {
                return;
            };
            for (id, reason) in &report.failed {
                warn!(%id, %reason, "subscription left inactive until next start");
            }
        });
    }

    {
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = service.run_ingestion().await {
                error!(error = %e, "event ingestion stopped");
            }
        });
    }

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        service: service.clone(),
        source,
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handlers::handle_message))
        .branch(Update::filter_channel_post().endpoint(handlers::handle_channel_post));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    service.shutdown().await;
    Ok(())
}
