//! Reactive bus.
//!
//! Subscribers register a [`Selector`] and a callback. Whenever a replica
//! write touches the selected collection, the view is recomputed and, if it
//! changed, handed to the callback.

use crate::{
    error::Result,
    schema::TRANSLATIONS,
    store::{ChangeEvent, ReplicaStore},
    translation, CollectionName, Record,
};
use dashmap::DashMap;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// What a subscriber is looking at.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Active records of a collection
    Records {
        collection: CollectionName,
        /// Field equality constraints, all of which must hold
        filter: Vec<(String, Value)>,
        /// Sort field; records are ordered by id when absent
        sort_by: Option<String>,
    },
    /// The translation tree for a locale
    Translations {
        locale: String,
        default_locale: String,
    },
}

impl Selector {
    /// Every active record of `collection`.
    pub fn collection(collection: impl Into<CollectionName>) -> Self {
        Selector::Records {
            collection: collection.into(),
            filter: Vec::new(),
            sort_by: None,
        }
    }

    /// Only records whose `field` equals `value`.
    pub fn where_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        if let Selector::Records { filter, .. } = &mut self {
            filter.push((field.into(), value));
        }
        self
    }

    /// Order records by `field`.
    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        if let Selector::Records { sort_by, .. } = &mut self {
            *sort_by = Some(field.into());
        }
        self
    }

    /// The translation tree for `locale`.
    pub fn translations(locale: impl Into<String>, default_locale: impl Into<String>) -> Self {
        Selector::Translations {
            locale: locale.into(),
            default_locale: default_locale.into(),
        }
    }

    /// The collection whose writes affect this selector.
    pub fn watched_collection(&self) -> &str {
        match self {
            Selector::Records { collection, .. } => collection,
            Selector::Translations { .. } => TRANSLATIONS,
        }
    }

    async fn compute(&self, store: &ReplicaStore) -> Result<View> {
        match self {
            Selector::Records {
                collection,
                filter,
                sort_by,
            } => {
                let mut records = store
                    .list_where(collection, |record| {
                        filter
                            .iter()
                            .all(|(field, value)| record.field(field) == Some(value))
                    })
                    .await?;
                if let Some(field) = sort_by {
                    // Stable sort keeps id order among equal keys.
                    records.sort_by(|a, b| compare_fields(a.field(field), b.field(field)));
                }
                Ok(View::Records(records))
            }
            Selector::Translations {
                locale,
                default_locale,
            } => {
                let records = store.list(TRANSLATIONS).await?;
                Ok(View::Translations(translation::project(
                    &records,
                    locale,
                    default_locale,
                )))
            }
        }
    }
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A computed view.
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    Records(Vec<Record>),
    Translations(Value),
}

impl View {
    pub fn records(&self) -> Option<&[Record]> {
        match self {
            View::Records(records) => Some(records),
            View::Translations(_) => None,
        }
    }

    pub fn translations(&self) -> Option<&Value> {
        match self {
            View::Translations(tree) => Some(tree),
            View::Records(_) => None,
        }
    }
}

/// Where a subscription stands.
///
/// A subscription starts out `Loading` and never returns to it once a view
/// has been delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Loading,
    Ready(Arc<View>),
}

impl ViewState {
    pub fn is_loading(&self) -> bool {
        matches!(self, ViewState::Loading)
    }

    pub fn view(&self) -> Option<&View> {
        match self {
            ViewState::Loading => None,
            ViewState::Ready(view) => Some(view),
        }
    }
}

/// Receives every new view of a subscription.
pub type Callback = Arc<dyn Fn(&ViewState) + Send + Sync>;

/// Identifies a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscription {
    selector: Mutex<Selector>,
    state: Mutex<ViewState>,
    callback: Callback,
    /// Serializes recomputation of this subscription.
    refreshing: tokio::sync::Mutex<()>,
}

impl Subscription {
    fn selector(&self) -> Selector {
        self.selector.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn state(&self) -> ViewState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Fans replica changes out to subscribers.
pub struct Bus {
    store: Arc<ReplicaStore>,
    subscriptions: DashMap<SubscriptionHandle, Arc<Subscription>>,
    /// Index of subscriptions by watched collection.
    by_collection: DashMap<CollectionName, HashSet<SubscriptionHandle>>,
}

impl Bus {
    pub fn new(store: Arc<ReplicaStore>) -> Self {
        Self {
            store,
            subscriptions: DashMap::new(),
            by_collection: DashMap::new(),
        }
    }

    /// Register a subscriber and load its first view.
    ///
    /// The callback sees the first view before this returns. If the first
    /// load fails the subscription stays `Loading` until the next change to
    /// its collection.
    pub async fn subscribe<F>(&self, selector: Selector, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ViewState) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(Uuid::new_v4());
        let collection = selector.watched_collection().to_string();
        let subscription = Arc::new(Subscription {
            selector: Mutex::new(selector),
            state: Mutex::new(ViewState::Loading),
            callback: Arc::new(callback),
            refreshing: tokio::sync::Mutex::new(()),
        });

        self.subscriptions.insert(handle, subscription.clone());
        self.by_collection
            .entry(collection.clone())
            .or_default()
            .insert(handle);
        debug!(%handle, collection, "subscription registered");

        self.refresh(handle, &subscription).await;
        handle
    }

    /// Drop a subscription. Its callback is not called again.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let Some((_, subscription)) = self.subscriptions.remove(&handle) else {
            return false;
        };
        let collection = subscription.selector().watched_collection().to_string();
        self.unindex(&collection, handle);
        debug!(%handle, collection, "subscription removed");
        true
    }

    /// Point a subscription at a new selector and recompute at once.
    pub async fn update_selector(&self, handle: SubscriptionHandle, selector: Selector) -> bool {
        let Some(subscription) = self.get(handle) else {
            return false;
        };

        let previous = {
            let mut current = subscription
                .selector
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, selector.clone())
        };
        if !self.reindex(handle, &previous, &selector) {
            return false;
        }

        self.refresh(handle, &subscription).await;
        true
    }

    /// Move `handle` from the collection `previous` watches to the one
    /// `selector` watches. Returns false, leaving no index entry behind,
    /// when the handle was unsubscribed meanwhile.
    fn reindex(&self, handle: SubscriptionHandle, previous: &Selector, selector: &Selector) -> bool {
        if previous.watched_collection() != selector.watched_collection() {
            self.unindex(previous.watched_collection(), handle);
            self.by_collection
                .entry(selector.watched_collection().to_string())
                .or_default()
                .insert(handle);
        }
        if !self.subscriptions.contains_key(&handle) {
            self.unindex(selector.watched_collection(), handle);
            return false;
        }
        true
    }

    /// Switch the locale of a translation subscription.
    ///
    /// Returns false for unknown handles and record subscriptions.
    pub async fn set_locale(&self, handle: SubscriptionHandle, locale: &str) -> bool {
        let Some(subscription) = self.get(handle) else {
            return false;
        };
        let selector = match subscription.selector() {
            Selector::Translations { default_locale, .. } => {
                Selector::translations(locale, default_locale)
            }
            Selector::Records { .. } => return false,
        };
        self.update_selector(handle, selector).await
    }

    /// The latest state of a subscription.
    pub fn state(&self, handle: SubscriptionHandle) -> Option<ViewState> {
        self.get(handle).map(|s| s.state())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Recompute every subscription watching `collection`.
    pub async fn notify(&self, collection: &str) {
        let handles: Vec<_> = self
            .by_collection
            .get(collection)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for handle in handles {
            if let Some(subscription) = self.get(handle) {
                self.refresh(handle, &subscription).await;
            }
        }
    }

    /// Recompute every subscription.
    pub async fn notify_all(&self) {
        let subscriptions: Vec<_> = self
            .subscriptions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (handle, subscription) in subscriptions {
            self.refresh(handle, &subscription).await;
        }
    }

    /// Spawn the task that turns replica changes into recomputations.
    ///
    /// A burst of changes is coalesced so each affected subscription is
    /// recomputed once. The task ends when the bus is dropped.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.store.subscribe_changes();
        let bus: Weak<Bus> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let mut touched = HashSet::new();
                let mut lagged = false;

                match changes.recv().await {
                    Ok(ChangeEvent { collection, .. }) => {
                        touched.insert(collection);
                    }
                    Err(RecvError::Lagged(_)) => lagged = true,
                    Err(RecvError::Closed) => break,
                }
                loop {
                    match changes.try_recv() {
                        Ok(ChangeEvent { collection, .. }) => {
                            touched.insert(collection);
                        }
                        Err(TryRecvError::Lagged(_)) => lagged = true,
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }

                let Some(bus) = bus.upgrade() else {
                    break;
                };
                if lagged {
                    warn!("change stream lagged, refreshing every subscription");
                    bus.notify_all().await;
                    continue;
                }
                for collection in touched {
                    bus.notify(&collection).await;
                }
            }
            debug!("bus dispatcher stopped");
        })
    }

    fn get(&self, handle: SubscriptionHandle) -> Option<Arc<Subscription>> {
        self.subscriptions.get(&handle).map(|s| s.value().clone())
    }

    fn unindex(&self, collection: &str, handle: SubscriptionHandle) {
        if let Some(mut handles) = self.by_collection.get_mut(collection) {
            handles.remove(&handle);
        }
        self.by_collection
            .remove_if(collection, |_, handles| handles.is_empty());
    }

    async fn refresh(&self, handle: SubscriptionHandle, subscription: &Subscription) {
        let _refreshing = subscription.refreshing.lock().await;
        let selector = subscription.selector();

        let view = match selector.compute(&self.store).await {
            Ok(view) => view,
            Err(e) => {
                warn!(%handle, error = %e, "view recomputation failed");
                return;
            }
        };

        let next = {
            let mut state = subscription.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.view() == Some(&view) {
                return;
            }
            *state = ViewState::Ready(Arc::new(view));
            state.clone()
        };

        if self.subscriptions.contains_key(&handle) {
            (subscription.callback)(&next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    async fn test_bus() -> (Arc<ReplicaStore>, Arc<Bus>) {
        let store = Arc::new(ReplicaStore::new(db::connect_in_memory().await.unwrap()));
        let bus = Arc::new(Bus::new(store.clone()));
        (store, bus)
    }

    fn recorder() -> (Arc<Mutex<Vec<ViewState>>>, impl Fn(&ViewState) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |state: &ViewState| {
            sink.lock().unwrap().push(state.clone());
        })
    }

    #[tokio::test]
    async fn subscribe_delivers_initial_view() {
        let (store, bus) = test_bus().await;
        store
            .put(Record::new("p-1", "products", json!({"name": "Tea"})))
            .await
            .unwrap();

        let (seen, callback) = recorder();
        let handle = bus.subscribe(Selector::collection("products"), callback).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].view().unwrap().records().unwrap().len(), 1);
        assert!(!bus.state(handle).unwrap().is_loading());
    }

    #[tokio::test]
    async fn filters_and_sorts() {
        let (store, bus) = test_bus().await;
        for (id, name, price, active) in [
            ("p-1", "Tea", 3.0, true),
            ("p-2", "Coffee", 2.5, true),
            ("p-3", "Juice", 1.0, false),
        ] {
            store
                .put(Record::new(
                    id,
                    "products",
                    json!({"name": name, "price": price, "active": active}),
                ))
                .await
                .unwrap();
        }

        let selector = Selector::collection("products")
            .where_eq("active", json!(true))
            .sort_by("price");
        let handle = bus.subscribe(selector, |_| {}).await;

        let state = bus.state(handle).unwrap();
        let ids: Vec<_> = state
            .view()
            .unwrap()
            .records()
            .unwrap()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["p-2", "p-1"]);
    }

    #[tokio::test]
    async fn notify_only_reports_changed_views() {
        let (store, bus) = test_bus().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bus.subscribe(Selector::collection("clients"), move |_| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        })
        .await;
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        bus.notify("clients").await;
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        store
            .put(Record::new("c-1", "clients", json!({"name": "Ana"})))
            .await
            .unwrap();
        bus.notify("clients").await;
        bus.notify("products").await;
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_callbacks() {
        let (store, bus) = test_bus().await;
        let (seen, callback) = recorder();
        let handle = bus.subscribe(Selector::collection("clients"), callback).await;

        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(handle));
        store
            .put(Record::new("c-1", "clients", json!({"name": "Ana"})))
            .await
            .unwrap();
        bus.notify("clients").await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn reindex_after_unsubscribe_leaves_no_entry() {
        let (_store, bus) = test_bus().await;
        let clients = Selector::collection("clients");
        let products = Selector::collection("products");
        let handle = bus.subscribe(clients.clone(), |_| {}).await;
        assert!(bus.reindex(handle, &clients, &clients));

        // Unsubscribed while a selector change was in flight.
        assert!(bus.unsubscribe(handle));
        assert!(!bus.reindex(handle, &clients, &products));
        assert!(bus.by_collection.is_empty());
        assert!(!bus.update_selector(handle, products).await);
    }

    #[tokio::test]
    async fn locale_switch_reprojects() {
        let (store, bus) = test_bus().await;
        store
            .put(Record::new(
                "t-1",
                TRANSLATIONS,
                json!({"key": "menu.file", "values": {"en": "File", "es": "Archivo"}}),
            ))
            .await
            .unwrap();

        let (seen, callback) = recorder();
        let handle = bus
            .subscribe(Selector::translations("en", "en"), callback)
            .await;
        assert!(bus.set_locale(handle, "es").await);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1].view().unwrap().translations(),
            Some(&json!({"menu": {"file": "Archivo"}}))
        );
    }

    #[tokio::test]
    async fn set_locale_rejects_record_subscriptions() {
        let (_store, bus) = test_bus().await;
        let handle = bus.subscribe(Selector::collection("clients"), |_| {}).await;
        assert!(!bus.set_locale(handle, "es").await);
    }

    #[tokio::test]
    async fn update_selector_moves_index() {
        let (store, bus) = test_bus().await;
        let (seen, callback) = recorder();
        let handle = bus.subscribe(Selector::collection("clients"), callback).await;

        assert!(bus.update_selector(handle, Selector::collection("taxes")).await);
        store
            .put(Record::new("t-1", "taxes", json!({"name": "VAT", "rate": 0.21})))
            .await
            .unwrap();
        bus.notify("taxes").await;

        // Initial empty clients view, then the first taxes view.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].view().unwrap().records().unwrap()[0].id, "t-1");
    }

    #[test]
    fn compare_fields_orders_mixed_values() {
        assert_eq!(
            compare_fields(Some(&json!(2)), Some(&json!(10))),
            Ordering::Less
        );
        assert_eq!(
            compare_fields(Some(&json!("b")), Some(&json!("a"))),
            Ordering::Greater
        );
        assert_eq!(compare_fields(None, Some(&json!(1))), Ordering::Less);
    }
}
