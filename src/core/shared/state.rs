use crate::billing::stripe::StripeClient;
use crate::core::config::AppConfig;
use crate::core::shared::utils::DbPool;
use crate::drive::ObjectStore;
use crate::enrichment::apollo::ApolloClient;
use crate::enrichment::realestate::RealEstateClient;
use crate::gianna::GiannaSettingsStore;
use crate::llm::{self, TextGenerator};
use crate::notifications::NotificationLog;
use crate::sdr::{ActivitySource, DbActivitySource};
use crate::sms::queue::SmsQueue;
use crate::sms::signalhouse::SignalHouseClient;
use crate::sms::SmsSender;
use std::sync::Arc;

pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub sms_queue: Arc<SmsQueue>,
    pub notifications: Arc<NotificationLog>,
    pub gianna: Arc<GiannaSettingsStore>,
    pub activity: Arc<dyn ActivitySource>,
    pub sms_sender: Option<Arc<dyn SmsSender>>,
    pub signalhouse: Option<Arc<SignalHouseClient>>,
    pub stripe: Option<Arc<StripeClient>>,
    pub apollo: Option<Arc<ApolloClient>>,
    pub realestate: Option<Arc<RealEstateClient>>,
    pub drive: Option<Arc<dyn ObjectStore>>,
    pub llm: Option<Arc<dyn TextGenerator>>,
}

impl AppState {
    /// Builds every provider client the config has keys for. Object storage
    /// needs an async handshake and is attached afterwards.
    pub fn from_config(config: AppConfig, conn: DbPool) -> Self {
        let signalhouse = config
            .signalhouse
            .as_ref()
            .map(|c| Arc::new(SignalHouseClient::new(c)));
        let sms_sender = signalhouse
            .clone()
            .map(|client| client as Arc<dyn SmsSender>);

        Self {
            sms_queue: Arc::new(SmsQueue::new(config.sms.clone())),
            notifications: Arc::new(NotificationLog::default()),
            gianna: Arc::new(GiannaSettingsStore::default()),
            activity: Arc::new(DbActivitySource::new(conn.clone())),
            sms_sender,
            signalhouse,
            stripe: config.stripe.as_ref().map(|c| Arc::new(StripeClient::new(c))),
            apollo: config.apollo.as_ref().map(|c| Arc::new(ApolloClient::new(c))),
            realestate: config
                .realestate
                .as_ref()
                .map(|c| Arc::new(RealEstateClient::new(c))),
            drive: None,
            llm: llm::generator_from_config(&config.llm),
            conn,
            config,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("conn", &"DbPool")
            .field("sms_queue", &self.sms_queue)
            .field("notifications", &self.notifications)
            .field("sms_sender", &self.sms_sender.is_some())
            .field("signalhouse", &self.signalhouse.is_some())
            .field("stripe", &self.stripe.is_some())
            .field("apollo", &self.apollo.is_some())
            .field("realestate", &self.realestate.is_some())
            .field("drive", &self.drive.is_some())
            .field("llm", &self.llm.is_some())
            .finish_non_exhaustive()
    }
}
