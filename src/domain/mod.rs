pub mod account;
pub mod activity;
pub mod attempt;
pub mod content;
pub mod metric;
pub mod rate_limit;
pub mod schedule;

pub use account::{Account, AccountStatus, ProxyProtocol};
pub use activity::{ActivityLevel, ActivityLogEntry};
pub use attempt::{AttemptStatus, PublishAttempt};
pub use content::{Content, ContentStatus, ContentVariant};
pub use metric::PostMetric;
pub use rate_limit::RateLimitSnapshot;
pub use schedule::{Schedule, ScheduleStatus};
