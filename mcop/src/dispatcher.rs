//! The runtime context: request ids, reply correlation, local objects and
//! connections. Constructed once and shared as `Arc<Dispatcher>`.

use crate::buffer::Buffer;
use crate::config::McopConfig;
use crate::connection::{Connection, LocalConnection, TcpConnection};
use crate::error::{Error, Result};
use crate::message::{self, Incoming, ReturnStatus};
use crate::notification::NotificationManager;
use crate::object::{DispatchStatus, LOOKUP_METHOD, ObjectReference, Skeleton};
use crate::thread::Threads;
use crate::types::MethodSignature;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct Reply {
    status: ReturnStatus,
    buffer: Buffer,
}

/// Cancels a request's correlation when dropped, whether the wait finished
/// or its future was abandoned. Cancelling a completed request does nothing.
pub(crate) struct RequestGuard<'a> {
    dispatcher: &'a Dispatcher,
    request_id: u32,
}

impl<'a> RequestGuard<'a> {
    pub(crate) fn new(dispatcher: &'a Dispatcher, request_id: u32) -> Self {
        Self {
            dispatcher,
            request_id,
        }
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.cancel(self.request_id);
    }
}

#[derive(Default)]
struct Correlations {
    senders: HashMap<u32, oneshot::Sender<Reply>>,
    receivers: HashMap<u32, oneshot::Receiver<Reply>>,
}

pub struct Dispatcher {
    config: McopConfig,
    threads: Arc<Threads>,
    loopback: Arc<LocalConnection>,
    next_request_id: AtomicU32,
    next_object_id: AtomicU32,
    correlations: Mutex<Correlations>,
    objects: Mutex<HashMap<u32, Arc<Skeleton>>>,
    notifications: Arc<NotificationManager>,
    delivering_notifications: AtomicBool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("threads", &self.threads)
            .field("pending_requests", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(config: McopConfig, threads: Arc<Threads>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            threads,
            loopback: Arc::new(LocalConnection::new(weak.clone())),
            next_request_id: AtomicU32::new(1),
            next_object_id: AtomicU32::new(1),
            correlations: Mutex::new(Correlations::default()),
            objects: Mutex::new(HashMap::new()),
            notifications: Arc::new(NotificationManager::new()),
            delivering_notifications: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &McopConfig {
        &self.config
    }

    pub fn threads(&self) -> &Arc<Threads> {
        &self.threads
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.notifications
    }

    /// Delivers notifications from a task on the current tokio runtime as
    /// soon as they are sent. Later calls do nothing.
    pub fn start_notifications(&self) {
        if self.delivering_notifications.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notifications.spawn_delivery();
        debug!("notification delivery started");
    }

    /// Publishes a skeleton and returns a reference reachable through the
    /// in-process loopback.
    pub fn add_object(&self, skeleton: Skeleton) -> ObjectReference {
        let object_id = self.next_object_id.fetch_add(1, Ordering::Relaxed);
        debug!("object {object_id} implements {}", skeleton.interface());
        self.objects
            .lock()
            .expect("object pool poisoned")
            .insert(object_id, Arc::new(skeleton));
        ObjectReference::new(self.loopback.clone(), object_id)
    }

    pub fn remove_object(&self, object_id: u32) -> bool {
        self.objects
            .lock()
            .expect("object pool poisoned")
            .remove(&object_id)
            .is_some()
    }

    /// Allocates a request id, registers its correlation and writes the
    /// invocation header. The caller appends arguments and patches the length.
    pub fn create_request(&self, object_id: u32, method_id: i32) -> (u32, Buffer) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut correlations = self.correlations.lock().expect("correlations poisoned");
        correlations.senders.insert(request_id, tx);
        correlations.receivers.insert(request_id, rx);
        (
            request_id,
            message::invocation(object_id, method_id, request_id, false),
        )
    }

    /// Drops the correlation; a reply arriving later is discarded.
    pub fn cancel(&self, request_id: u32) -> bool {
        let mut correlations = self.correlations.lock().expect("correlations poisoned");
        let had_receiver = correlations.receivers.remove(&request_id).is_some();
        correlations.senders.remove(&request_id).is_some() || had_receiver
    }

    pub fn pending_requests(&self) -> usize {
        self.correlations
            .lock()
            .expect("correlations poisoned")
            .senders
            .len()
    }

    pub fn send(&self, object: &ObjectReference, buffer: Buffer) -> Result<()> {
        let connection = object.connection().ok_or(Error::ConnectionClosed)?;
        connection.send_buffer(buffer)
    }

    /// Waits for the reply to `request_id`, up to the configured timeout.
    /// Returns the reply positioned at the return value.
    pub async fn wait_for_result(&self, request_id: u32) -> Result<Buffer> {
        let receiver = self
            .correlations
            .lock()
            .expect("correlations poisoned")
            .receivers
            .remove(&request_id)
            .ok_or(Error::UnknownRequest(request_id))?;
        let _guard = RequestGuard::new(self, request_id);
        let reply = match tokio::time::timeout(self.config.request_timeout(), receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => return Err(Error::Timeout(request_id, self.config.request_timeout_ms)),
        };
        match reply.status {
            ReturnStatus::Ok => Ok(reply.buffer),
            status => Err(Error::Remote(status)),
        }
    }

    /// Sends a request built by [`Self::create_request`] and waits for its
    /// reply. The correlation is gone afterwards whatever the outcome.
    pub async fn call(&self, object: &ObjectReference, request_id: u32, buffer: Buffer) -> Result<Buffer> {
        let _guard = RequestGuard::new(self, request_id);
        self.send(object, buffer)?;
        self.wait_for_result(request_id).await
    }

    /// Asks the object's `_lookupMethod` for the id of `signature`.
    pub async fn lookup_method(&self, object: &ObjectReference, signature: &MethodSignature) -> Result<Option<i32>> {
        let (request_id, mut buffer) = self.create_request(object.object_id(), LOOKUP_METHOD);
        signature.write_to(&mut buffer);
        buffer.patch_length();
        let mut reply = self.call(object, request_id, buffer).await?;
        let method_id = reply.read_long();
        if reply.read_error() {
            return Err(Error::BadMessage("lookup reply without id".to_string()));
        }
        Ok((method_id >= 0).then_some(method_id))
    }

    /// Entry point for every message a connection receives.
    pub fn handle_message(&self, mut buffer: Buffer, connection: &dyn Connection) {
        match message::parse(&mut buffer) {
            Ok(Incoming::Return { request_id, status }) => self.complete(request_id, status, buffer),
            Ok(Incoming::Invocation {
                object_id,
                method_id,
                request_id,
                oneway,
            }) => {
                let reply = self.invoke_local(object_id, method_id, request_id, &mut buffer);
                if oneway {
                    return;
                }
                if let Err(err) = connection.send_buffer(reply) {
                    warn!("reply {request_id} to {} lost: {err}", connection.describe());
                }
            }
            Err(err) => warn!("from {}: {err}", connection.describe()),
        }
    }

    fn complete(&self, request_id: u32, status: ReturnStatus, buffer: Buffer) {
        let sender = self
            .correlations
            .lock()
            .expect("correlations poisoned")
            .senders
            .remove(&request_id);
        match sender {
            // The waiter may have given up in the meantime
            Some(sender) => {
                let _ = sender.send(Reply { status, buffer });
            }
            None => warn!("{}", Error::UnknownRequest(request_id)),
        }
    }

    fn invoke_local(&self, object_id: u32, method_id: i32, request_id: u32, request: &mut Buffer) -> Buffer {
        let skeleton = self
            .objects
            .lock()
            .expect("object pool poisoned")
            .get(&object_id)
            .cloned();
        let mut result = Buffer::new();
        let status = match skeleton {
            Some(skeleton) => match skeleton.dispatch(method_id, request, &mut result) {
                DispatchStatus::Ok => ReturnStatus::Ok,
                DispatchStatus::NoSuchMethod => {
                    warn!("{}: no method {method_id}", skeleton.interface());
                    ReturnStatus::NoSuchMethod
                }
            },
            None => {
                warn!("invocation of unknown object {object_id}");
                ReturnStatus::NoSuchObject
            }
        };
        let mut reply = message::reply(request_id, status);
        if status == ReturnStatus::Ok {
            reply.write_block(result.as_bytes());
        }
        reply.patch_length();
        reply
    }

    pub async fn connect(self: &Arc<Self>, addr: impl ToSocketAddrs) -> Result<Arc<TcpConnection>> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        self.start_notifications();
        Ok(TcpConnection::spawn(stream, Arc::downgrade(self)))
    }

    /// Accepts peers until the listener fails.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("serving on {}", listener.local_addr()?);
        self.start_notifications();
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("accepted {addr}");
            TcpConnection::spawn(stream, Arc::downgrade(self));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeCode;
    use std::sync::Mutex as StdMutex;

    /// Records what it is asked to send instead of delivering it.
    #[derive(Default)]
    struct Capture {
        sent: StdMutex<Vec<Buffer>>,
    }

    impl Connection for Capture {
        fn send_buffer(&self, buffer: Buffer) -> Result<()> {
            self.sent.lock().unwrap().push(buffer);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "capture".to_string()
        }
    }

    fn dispatcher(timeout_ms: u64) -> Arc<Dispatcher> {
        let config = McopConfig {
            request_timeout_ms: timeout_ms,
            ..McopConfig::default()
        };
        Dispatcher::new(config, Arc::new(Threads::new()))
    }

    fn echo_skeleton() -> Skeleton {
        let mut skeleton = Skeleton::new("Echo");
        skeleton.add_method(
            MethodSignature::new("echo", &[TypeCode::Long], TypeCode::Long),
            |request, result| result.write_long(request.read_long()),
        );
        skeleton
    }

    fn reply_with(request_id: u32, value: i32) -> Buffer {
        let mut reply = message::reply(request_id, ReturnStatus::Ok);
        reply.write_long(value);
        reply.patch_length();
        reply
    }

    #[tokio::test]
    async fn local_call_round_trips() {
        let dispatcher = dispatcher(1000);
        let object = dispatcher.add_object(echo_skeleton());
        let (request_id, mut buffer) = dispatcher.create_request(object.object_id(), 1);
        buffer.write_long(17);
        buffer.patch_length();
        let mut reply = dispatcher.call(&object, request_id, buffer).await.unwrap();
        assert_eq!(reply.read_long(), 17);
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn abandoned_call_leaves_no_correlation() {
        let dispatcher = dispatcher(60_000);
        let object = ObjectReference::new(Arc::new(Capture::default()), 1);
        let (request_id, mut buffer) = dispatcher.create_request(1, 1);
        buffer.patch_length();
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            dispatcher.call(&object, request_id, buffer),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(dispatcher.pending_requests(), 0);
        assert!(!dispatcher.cancel(request_id));
    }

    #[derive(Default)]
    struct Listener {
        ids: StdMutex<Vec<i32>>,
    }

    impl crate::notification::NotificationClient for Listener {
        fn notify(&self, notification: &crate::notification::Notification) {
            self.ids.lock().unwrap().push(notification.id());
        }
    }

    #[tokio::test]
    async fn started_notifications_are_delivered_without_run() {
        let dispatcher = dispatcher(1000);
        dispatcher.start_notifications();
        dispatcher.start_notifications();
        let listener = Arc::new(Listener::default());
        let id = dispatcher.notifications().register(&listener);
        for n in 1..=3 {
            dispatcher
                .notifications()
                .send(crate::notification::Notification::new(id, n, ()));
        }
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while listener.ids.lock().unwrap().len() < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("notifications were not delivered");
        assert_eq!(*listener.ids.lock().unwrap(), vec![1, 2, 3]);
        assert!(!dispatcher.notifications().pending());
    }

    #[tokio::test]
    async fn replies_match_by_id_in_any_order() {
        let dispatcher = dispatcher(1000);
        let capture = Capture::default();
        let (first, _) = dispatcher.create_request(1, 1);
        let (second, _) = dispatcher.create_request(1, 1);
        assert_eq!(dispatcher.pending_requests(), 2);

        dispatcher.handle_message(reply_with(second, 2), &capture);
        dispatcher.handle_message(reply_with(first, 1), &capture);

        assert_eq!(dispatcher.wait_for_result(first).await.unwrap().read_long(), 1);
        assert_eq!(dispatcher.wait_for_result(second).await.unwrap().read_long(), 2);
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_the_correlation() {
        let dispatcher = dispatcher(20);
        let (request_id, _) = dispatcher.create_request(1, 1);
        let err = dispatcher.wait_for_result(request_id).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(id, 20) if id == request_id));
        assert_eq!(dispatcher.pending_requests(), 0);

        // A late reply is dropped without effect
        dispatcher.handle_message(reply_with(request_id, 5), &Capture::default());
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn cancel_forgets_request() {
        let dispatcher = dispatcher(1000);
        let (request_id, _) = dispatcher.create_request(1, 1);
        assert!(dispatcher.cancel(request_id));
        assert!(!dispatcher.cancel(request_id));
        assert!(matches!(
            dispatcher.wait_for_result(request_id).await,
            Err(Error::UnknownRequest(_))
        ));
    }

    #[test]
    fn unknown_object_and_method_answer_with_status() {
        let dispatcher = dispatcher(1000);
        let object = dispatcher.add_object(echo_skeleton());
        let capture = Capture::default();

        let mut missing_object = message::invocation(999, 1, 7, false);
        missing_object.patch_length();
        dispatcher.handle_message(missing_object, &capture);

        let mut missing_method = message::invocation(object.object_id(), 9, 8, false);
        missing_method.patch_length();
        dispatcher.handle_message(missing_method, &capture);

        let mut sent = capture.sent.lock().unwrap();
        assert_eq!(
            message::parse(&mut sent[0]).unwrap(),
            Incoming::Return {
                request_id: 7,
                status: ReturnStatus::NoSuchObject
            }
        );
        assert_eq!(
            message::parse(&mut sent[1]).unwrap(),
            Incoming::Return {
                request_id: 8,
                status: ReturnStatus::NoSuchMethod
            }
        );
    }

    #[test]
    fn oneway_invocations_get_no_reply() {
        let dispatcher = dispatcher(1000);
        let object = dispatcher.add_object(echo_skeleton());
        let capture = Capture::default();
        let mut buffer = message::invocation(object.object_id(), 1, 3, true);
        buffer.write_long(1);
        buffer.patch_length();
        dispatcher.handle_message(buffer, &capture);
        assert!(capture.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_goes_through_method_zero() {
        let dispatcher = dispatcher(1000);
        let object = dispatcher.add_object(echo_skeleton());
        let echo = MethodSignature::new("echo", &[TypeCode::Long], TypeCode::Long);
        assert_eq!(dispatcher.lookup_method(&object, &echo).await.unwrap(), Some(1));
        let other = MethodSignature::new("echo", &[TypeCode::Float], TypeCode::Long);
        assert_eq!(dispatcher.lookup_method(&object, &other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn null_reference_cannot_send() {
        let dispatcher = dispatcher(1000);
        let (request_id, buffer) = dispatcher.create_request(0, 1);
        let err = dispatcher
            .call(&ObjectReference::null(), request_id, buffer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn removed_object_is_no_such_object() {
        let dispatcher = dispatcher(1000);
        let object = dispatcher.add_object(echo_skeleton());
        assert!(dispatcher.remove_object(object.object_id()));
        let (request_id, mut buffer) = dispatcher.create_request(object.object_id(), 1);
        buffer.write_long(1);
        buffer.patch_length();
        let err = dispatcher.call(&object, request_id, buffer).await.unwrap_err();
        assert!(matches!(err, Error::Remote(ReturnStatus::NoSuchObject)));
    }
}
