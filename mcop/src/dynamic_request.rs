//! Building and sending invocations whose shape is only known at runtime.
//!
//! ```ignore
//! let mut request = DynamicRequest::new(dispatcher, object);
//! let mut sum = AnyValue::Long(0);
//! request.method("add").param(2).param(40);
//! assert!(request.invoke_with(&mut sum).await);
//! ```
//!
//! The method id is resolved through the target's `_lookupMethod` the first
//! time a shape is used and cached until the name, a parameter type, the
//! parameter count or the return type changes.

use crate::buffer::Buffer;
use crate::dispatcher::{Dispatcher, RequestGuard};
use crate::message::{METHOD_ID_OFFSET, UNRESOLVED_METHOD};
use crate::object::ObjectReference;
use crate::types::{AnyValue, MethodSignature, TypeCode};
use std::sync::Arc;
use tracing::warn;

pub struct DynamicRequest {
    dispatcher: Arc<Dispatcher>,
    object: ObjectReference,
    pending: Option<(u32, Buffer)>,
    method_id: Option<i32>,
    // Shape `method_id` was resolved for
    signature: MethodSignature,
    name: String,
    params: Vec<TypeCode>,
    lookups: usize,
}

impl std::fmt::Debug for DynamicRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicRequest")
            .field("object", &self.object)
            .field("method_id", &self.method_id)
            .field("signature", &self.signature)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl DynamicRequest {
    pub fn new(dispatcher: Arc<Dispatcher>, object: ObjectReference) -> Self {
        Self {
            dispatcher,
            object,
            pending: None,
            method_id: None,
            signature: MethodSignature::unresolved(),
            name: String::new(),
            params: Vec::new(),
            lookups: 0,
        }
    }

    /// Starts a new call.
    ///
    /// # Panics
    ///
    /// Panics if the previous call was never invoked.
    pub fn method(&mut self, name: &str) -> &mut Self {
        assert!(
            self.pending.is_none(),
            "method({name}) while a request is still pending"
        );
        if name != self.signature.name {
            self.method_id = None;
        }
        self.name = name.to_string();
        self.params.clear();
        self.pending = Some(
            self.dispatcher
                .create_request(self.object.object_id(), UNRESOLVED_METHOD),
        );
        self
    }

    /// Appends an argument.
    ///
    /// # Panics
    ///
    /// Panics without a preceding [`Self::method`].
    pub fn param(&mut self, value: impl Into<AnyValue>) -> &mut Self {
        let value = value.into();
        let (_, buffer) = self
            .pending
            .as_mut()
            .expect("param() without method()");
        value.write_to(buffer);
        let code = value.type_code();
        if self.signature.params.get(self.params.len()) != Some(&code) {
            self.method_id = None;
        }
        self.params.push(code);
        self
    }

    /// Calls a method without a return value. `true` once the reply arrived.
    pub async fn invoke(&mut self) -> bool {
        self.perform(TypeCode::Void).await.is_some()
    }

    /// Calls a method and decodes its return value into `result`, whose
    /// current variant selects the expected return type.
    pub async fn invoke_with(&mut self, result: &mut AnyValue) -> bool {
        let code = result.type_code();
        let Some(mut reply) = self.perform(code).await else {
            return false;
        };
        match AnyValue::read_from(&mut reply, code) {
            Some(value) => {
                *result = value;
                true
            }
            None => {
                warn!("{}: reply carries no {code}", self.name);
                false
            }
        }
    }

    /// Method-id resolutions performed so far.
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn object(&self) -> &ObjectReference {
        &self.object
    }

    async fn perform(&mut self, return_type: TypeCode) -> Option<Buffer> {
        let Some((request_id, mut buffer)) = self.pending.take() else {
            warn!("invoke() without method()");
            return None;
        };
        let dispatcher = self.dispatcher.clone();
        let _guard = RequestGuard::new(&dispatcher, request_id);
        if self.params.len() != self.signature.params.len()
            || return_type != self.signature.return_type
        {
            self.method_id = None;
        }
        let method_id = match self.method_id {
            Some(id) => id,
            None => self.resolve(return_type).await?,
        };
        buffer.patch_long(METHOD_ID_OFFSET, method_id);
        buffer.patch_length();
        match dispatcher.call(&self.object, request_id, buffer).await {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!("{} on {:?} failed: {err}", self.name, self.object);
                None
            }
        }
    }

    async fn resolve(&mut self, return_type: TypeCode) -> Option<i32> {
        let signature = MethodSignature {
            name: self.name.clone(),
            params: self.params.clone(),
            return_type,
        };
        self.lookups += 1;
        match self.dispatcher.lookup_method(&self.object, &signature).await {
            Ok(Some(id)) => {
                self.signature = signature;
                self.method_id = Some(id);
                Some(id)
            }
            Ok(None) => {
                warn!("{:?} has no method {signature}", self.object);
                self.signature = MethodSignature::unresolved();
                None
            }
            Err(err) => {
                warn!("looking up {signature} on {:?}: {err}", self.object);
                self.signature = MethodSignature::unresolved();
                None
            }
        }
    }
}

impl Drop for DynamicRequest {
    fn drop(&mut self) {
        if let Some((request_id, _)) = self.pending.take() {
            self.dispatcher.cancel(request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McopConfig;
    use crate::object::Skeleton;
    use crate::thread::Threads;

    fn setup() -> (Arc<Dispatcher>, ObjectReference) {
        let dispatcher = Dispatcher::new(McopConfig::default(), Arc::new(Threads::new()));
        let mut skeleton = Skeleton::new("Calculator");
        skeleton.add_method(
            MethodSignature::new("add", &[TypeCode::Long, TypeCode::Long], TypeCode::Long),
            |request, result| {
                let a = request.read_long();
                let b = request.read_long();
                result.write_long(a + b);
            },
        );
        let object = dispatcher.add_object(skeleton);
        (dispatcher, object)
    }

    #[tokio::test]
    async fn repeated_shape_resolves_once() {
        let (dispatcher, object) = setup();
        let mut request = DynamicRequest::new(dispatcher.clone(), object);
        for (a, b) in [(1, 2), (10, 20), (-5, 5)] {
            let mut sum = AnyValue::Long(0);
            request.method("add").param(a).param(b);
            assert!(request.invoke_with(&mut sum).await);
            assert_eq!(sum, AnyValue::Long(a + b));
        }
        assert_eq!(request.lookups(), 1);
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn changed_param_type_resolves_again_and_fails() {
        let (dispatcher, object) = setup();
        let mut request = DynamicRequest::new(dispatcher.clone(), object);
        let mut sum = AnyValue::Long(0);
        request.method("add").param(1).param(2);
        assert!(request.invoke_with(&mut sum).await);

        request.method("add").param(1).param(2.0f32);
        assert!(!request.invoke_with(&mut sum).await);
        assert_eq!(request.lookups(), 2);
        assert!(!request.is_pending());
        assert_eq!(dispatcher.pending_requests(), 0);

        // Back to the known shape: one more lookup, then success
        request.method("add").param(3).param(4);
        assert!(request.invoke_with(&mut sum).await);
        assert_eq!(sum, AnyValue::Long(7));
        assert_eq!(request.lookups(), 3);
    }

    #[tokio::test]
    async fn return_type_is_part_of_the_shape() {
        let (dispatcher, object) = setup();
        let mut request = DynamicRequest::new(dispatcher, object);
        request.method("add").param(1).param(2);
        assert!(!request.invoke().await);
        assert_eq!(request.lookups(), 1);
    }

    #[tokio::test]
    async fn null_reference_fails() {
        let (dispatcher, _) = setup();
        let mut request = DynamicRequest::new(dispatcher.clone(), ObjectReference::null());
        request.method("add").param(1).param(2);
        assert!(!request.invoke().await);
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "still pending")]
    async fn method_twice_without_invoke_panics() {
        let (dispatcher, object) = setup();
        let mut request = DynamicRequest::new(dispatcher, object);
        request.method("add");
        request.method("add");
    }

    #[tokio::test]
    async fn dropping_an_uninvoked_request_cancels_it() {
        let (dispatcher, object) = setup();
        {
            let mut request = DynamicRequest::new(dispatcher.clone(), object);
            request.method("add").param(1);
            assert_eq!(dispatcher.pending_requests(), 1);
        }
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    /// Accepts everything and never answers.
    struct Silent;

    impl crate::connection::Connection for Silent {
        fn send_buffer(&self, _buffer: Buffer) -> crate::error::Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "silent".to_string()
        }
    }

    #[tokio::test]
    async fn abandoned_invoke_leaves_no_correlation() {
        let (dispatcher, _) = setup();
        let object = ObjectReference::new(Arc::new(Silent), 1);
        let mut request = DynamicRequest::new(dispatcher.clone(), object);

        // Abandoned while the method lookup is outstanding
        request.method("add").param(1).param(2);
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(20), request.invoke()).await;
        assert!(waited.is_err());
        assert_eq!(dispatcher.pending_requests(), 0);
        drop(request);
        assert_eq!(dispatcher.pending_requests(), 0);
    }
}
