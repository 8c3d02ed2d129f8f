//! Asynchronous, ordered delivery of payloads to registered receivers.
//!
//! A [`Notification`] owns its payload. Whatever happens to it, delivered,
//! cancelled through [`NotificationManager::remove_client`] or simply dropped,
//! its reclaim closure runs exactly once, from `Drop`.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type ClientId = u64;

type Payload = Box<dyn Any + Send>;
type Reclaim = Box<dyn FnOnce(Payload) + Send>;

pub trait NotificationClient: Send + Sync {
    fn notify(&self, notification: &Notification);
}

pub struct Notification {
    receiver: ClientId,
    id: i32,
    payload: Option<Payload>,
    reclaim: Option<Reclaim>,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
            .field("receiver", &self.receiver)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Notification {
    pub fn new<T: Any + Send>(receiver: ClientId, id: i32, payload: T) -> Self {
        Self {
            receiver,
            id,
            payload: Some(Box::new(payload)),
            reclaim: None,
        }
    }

    /// Runs once with the payload when the notification goes away.
    pub fn on_reclaim(mut self, reclaim: impl FnOnce(Payload) + Send + 'static) -> Self {
        self.reclaim = Some(Box::new(reclaim));
        self
    }

    pub fn receiver(&self) -> ClientId {
        self.receiver
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref()
    }

    pub fn reclaim(self) {
        drop(self);
    }
}

impl Drop for Notification {
    fn drop(&mut self) {
        if let (Some(payload), Some(reclaim)) = (self.payload.take(), self.reclaim.take()) {
            reclaim(payload);
        }
    }
}

#[derive(Default)]
struct Queues {
    /// Sent since the last `run` took its batch.
    waiting: VecDeque<Notification>,
    /// The batch a `run` is delivering right now.
    delivering: VecDeque<Notification>,
}

/// Clears the delivering flag even if a receiver panics.
struct DeliveryPass<'a>(&'a AtomicBool);

impl Drop for DeliveryPass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub struct NotificationManager {
    queues: Mutex<Queues>,
    clients: Mutex<HashMap<ClientId, Weak<dyn NotificationClient>>>,
    next_client: AtomicU64,
    delivering: AtomicBool,
    wakeup: Arc<Notify>,
}

impl std::fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager")
            .field(
                "pending",
                &self
                    .queues
                    .lock()
                    .map(|q| q.waiting.len() + q.delivering.len())
                    .unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl NotificationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: NotificationClient + 'static>(&self, client: &Arc<C>) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let weak: Weak<dyn NotificationClient> = Arc::downgrade(client) as Weak<C>;
        self.clients
            .lock()
            .expect("notification clients poisoned")
            .insert(id, weak);
        id
    }

    pub fn send(&self, notification: Notification) {
        self.queues
            .lock()
            .expect("notification queue poisoned")
            .waiting
            .push_back(notification);
        self.wakeup.notify_one();
    }

    pub fn pending(&self) -> bool {
        let queues = self.queues.lock().expect("notification queue poisoned");
        !queues.waiting.is_empty() || !queues.delivering.is_empty()
    }

    /// Delivers what was queued when the call started, in send order.
    /// Receivers may send or remove clients while being notified; nothing is
    /// locked during delivery. A nested or concurrent call returns at once.
    pub fn run(&self) {
        if self.delivering.swap(true, Ordering::AcqRel) {
            return;
        }
        let _pass = DeliveryPass(&self.delivering);
        {
            let mut guard = self.queues.lock().expect("notification queue poisoned");
            let queues = &mut *guard;
            queues.delivering.append(&mut queues.waiting);
        }
        loop {
            let Some(notification) = self
                .queues
                .lock()
                .expect("notification queue poisoned")
                .delivering
                .pop_front()
            else {
                break;
            };
            match self.client(notification.receiver) {
                Some(client) => client.notify(&notification),
                None => warn!(
                    "receiver {} is gone, dropping notification {}",
                    notification.receiver, notification.id
                ),
            }
        }
    }

    /// Live receiver for `id`. Entries whose receiver was dropped without
    /// `remove_client` are forgotten here.
    fn client(&self, id: ClientId) -> Option<Arc<dyn NotificationClient>> {
        let mut clients = self.clients.lock().expect("notification clients poisoned");
        let client = clients.get(&id)?.upgrade();
        if client.is_none() {
            clients.remove(&id);
        }
        client
    }

    pub fn clients(&self) -> usize {
        self.clients
            .lock()
            .expect("notification clients poisoned")
            .len()
    }

    /// Unregisters `client` and reclaims everything still queued for it,
    /// including the part of a batch `run` has not reached yet, without
    /// delivery. Returns how many notifications were cancelled.
    pub fn remove_client(&self, client: ClientId) -> usize {
        self.clients
            .lock()
            .expect("notification clients poisoned")
            .remove(&client);
        let mut cancelled = Vec::new();
        {
            let mut queues = self.queues.lock().expect("notification queue poisoned");
            let Queues {
                waiting,
                delivering,
            } = &mut *queues;
            for queue in [delivering, waiting] {
                let (gone, kept): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(|n| n.receiver == client);
                *queue = kept;
                cancelled.extend(gone);
            }
        }
        let count = cancelled.len();
        if count > 0 {
            debug!("reclaimed {count} notifications for receiver {client}");
        }
        // Reclaim closures run here, outside the queue lock
        drop(cancelled);
        count
    }

    /// Spawns a task that runs a delivery pass whenever something is sent.
    /// The task ends once the manager is dropped. Must be called from within
    /// a tokio runtime.
    pub fn spawn_delivery(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let wakeup = self.wakeup.clone();
        tokio::spawn(async move {
            loop {
                wakeup.notified().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.run();
                // Sends made by receivers during this pass
                if manager.pending() {
                    wakeup.notify_one();
                }
                drop(manager);
                tokio::task::yield_now().await;
            }
            debug!("notification delivery stopped");
        })
    }
}

impl Drop for NotificationManager {
    fn drop(&mut self) {
        self.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(i32, String)>>,
    }

    impl NotificationClient for Recorder {
        fn notify(&self, notification: &Notification) {
            let text = notification.payload::<String>().cloned().unwrap_or_default();
            self.received
                .lock()
                .unwrap()
                .push((notification.id(), text));
        }
    }

    fn counted(receiver: ClientId, id: i32, reclaimed: &Arc<AtomicUsize>) -> Notification {
        let reclaimed = reclaimed.clone();
        Notification::new(receiver, id, format!("payload {id}")).on_reclaim(move |_| {
            reclaimed.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn delivers_in_send_order() {
        let manager = NotificationManager::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let a_id = manager.register(&a);
        let b_id = manager.register(&b);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (receiver, id) in [(a_id, 1), (b_id, 2), (a_id, 3)] {
            let order = order.clone();
            manager.send(Notification::new(receiver, id, ()).on_reclaim(move |_| {
                order.lock().unwrap().push(id);
            }));
        }
        assert!(manager.pending());
        manager.run();
        assert!(!manager.pending());

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        let a_ids: Vec<i32> = a.received.lock().unwrap().iter().map(|r| r.0).collect();
        assert_eq!(a_ids, vec![1, 3]);
        assert_eq!(b.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn removed_receiver_gets_nothing_but_payloads_are_reclaimed() {
        let manager = NotificationManager::new();
        let doomed = Arc::new(Recorder::default());
        let alive = Arc::new(Recorder::default());
        let doomed_id = manager.register(&doomed);
        let alive_id = manager.register(&alive);
        let reclaimed = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            manager.send(counted(doomed_id, i, &reclaimed));
        }
        manager.send(counted(alive_id, 99, &reclaimed));

        assert_eq!(manager.remove_client(doomed_id), 5);
        assert_eq!(reclaimed.load(Ordering::SeqCst), 5);
        manager.run();

        assert_eq!(reclaimed.load(Ordering::SeqCst), 6);
        assert!(doomed.received.lock().unwrap().is_empty());
        assert_eq!(
            *alive.received.lock().unwrap(),
            vec![(99, "payload 99".to_string())]
        );
    }

    struct SelfRemoving {
        manager: Arc<NotificationManager>,
        id: Mutex<ClientId>,
    }

    impl NotificationClient for SelfRemoving {
        fn notify(&self, _notification: &Notification) {
            // Tears itself down on first delivery
            self.manager.remove_client(*self.id.lock().unwrap());
        }
    }

    #[test]
    fn teardown_during_run_cancels_the_rest() {
        let manager = Arc::new(NotificationManager::new());
        let client = Arc::new(SelfRemoving {
            manager: manager.clone(),
            id: Mutex::new(0),
        });
        let id = manager.register(&client);
        *client.id.lock().unwrap() = id;
        let reclaimed = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            manager.send(counted(id, i, &reclaimed));
        }
        manager.run();
        assert_eq!(reclaimed.load(Ordering::SeqCst), 4);
        assert!(!manager.pending());
    }

    #[test]
    fn dropped_receiver_without_teardown_is_skipped() {
        let manager = NotificationManager::new();
        let reclaimed = Arc::new(AtomicUsize::new(0));
        let id = {
            let client = Arc::new(Recorder::default());
            manager.register(&client)
        };
        assert_eq!(manager.clients(), 1);
        manager.send(counted(id, 1, &reclaimed));
        manager.run();
        assert_eq!(reclaimed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.clients(), 0);
    }

    struct Resender {
        manager: Arc<NotificationManager>,
        id: Mutex<ClientId>,
    }

    impl NotificationClient for Resender {
        fn notify(&self, notification: &Notification) {
            if notification.id() < 3 {
                let id = *self.id.lock().unwrap();
                self.manager
                    .send(Notification::new(id, notification.id() + 1, ()));
            }
        }
    }

    #[test]
    fn notifications_sent_during_run_wait_for_next_run() {
        let manager = Arc::new(NotificationManager::new());
        let client = Arc::new(Resender {
            manager: manager.clone(),
            id: Mutex::new(0),
        });
        let id = manager.register(&client);
        *client.id.lock().unwrap() = id;
        manager.send(Notification::new(id, 1, ()));
        manager.run();
        assert!(manager.pending());
        manager.run();
        manager.run();
        assert!(!manager.pending());
    }

    /// On its first notification, disconnects another receiver and queues a
    /// follow-up for itself.
    struct Disconnector {
        manager: Arc<NotificationManager>,
        own: Mutex<ClientId>,
        other: Mutex<ClientId>,
        seen: Mutex<Vec<i32>>,
    }

    impl NotificationClient for Disconnector {
        fn notify(&self, notification: &Notification) {
            self.seen.lock().unwrap().push(notification.id());
            if notification.id() == 1 {
                self.manager.remove_client(*self.other.lock().unwrap());
                self.manager
                    .send(Notification::new(*self.own.lock().unwrap(), 100, ()));
            }
        }
    }

    #[test]
    fn removal_during_run_keeps_new_sends_for_next_run() {
        let manager = Arc::new(NotificationManager::new());
        let first = Arc::new(Disconnector {
            manager: manager.clone(),
            own: Mutex::new(0),
            other: Mutex::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let second = Arc::new(Recorder::default());
        let first_id = manager.register(&first);
        let second_id = manager.register(&second);
        *first.own.lock().unwrap() = first_id;
        *first.other.lock().unwrap() = second_id;
        let reclaimed = Arc::new(AtomicUsize::new(0));

        manager.send(counted(first_id, 1, &reclaimed));
        manager.send(counted(second_id, 2, &reclaimed));
        manager.run();

        assert_eq!(*first.seen.lock().unwrap(), vec![1]);
        assert!(second.received.lock().unwrap().is_empty());
        assert_eq!(reclaimed.load(Ordering::SeqCst), 2);
        assert!(manager.pending());

        manager.run();
        assert_eq!(*first.seen.lock().unwrap(), vec![1, 100]);
        assert!(!manager.pending());
    }

    #[tokio::test]
    async fn delivery_task_runs_without_explicit_run() {
        let manager = Arc::new(NotificationManager::new());
        let task = manager.spawn_delivery();
        let client = Arc::new(Recorder::default());
        let id = manager.register(&client);

        manager.send(Notification::new(id, 7, "hello".to_string()));
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while client.received.lock().unwrap().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("notification was not delivered");
        assert_eq!(
            *client.received.lock().unwrap(),
            vec![(7, "hello".to_string())]
        );

        drop(manager);
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("delivery task kept running")
            .unwrap();
    }
}
