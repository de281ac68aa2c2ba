pub(crate) mod cache;
pub(crate) mod notifier;
pub(crate) mod persist;

pub(crate) use cache::{ResultCache, job_result_key};
pub(crate) use notifier::{DeliveryNotifier, DeliverySubscriber};
pub(crate) use persist::JobResultStore;
