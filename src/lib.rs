pub mod api_router;
pub mod billing;
pub mod campaigns;
pub mod core;
pub mod dialer;
pub mod drive;
pub mod enrichment;
pub mod gianna;
pub mod leads;
pub mod llm;
pub mod main_module;
pub mod notifications;
pub mod sdr;
pub mod sectors;
pub mod sms;
pub mod voice;

pub use crate::core::shared;
