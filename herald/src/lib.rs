pub mod controller;

pub use controller::{Herald, MailSettings, NoticeSettings, SHUTDOWN_BROADCAST, find_config_file};
