//! Resource subspace router.
//!
//! Extensions register a handler against a sequence of path segments; an
//! incoming request is dispatched to the registration whose segments form
//! the longest prefix of the request path.  Ties go to the earliest
//! registration, and a request matching nothing gets a 404.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures_util::future::BoxFuture;

use crate::connection::Connection;
use crate::http::{Request, Response};

/// Handler installed by an extension for one resource subspace.
///
/// The handler receives the full request, the underlying connection, and
/// the trailer: any bytes the transport buffered beyond the request's
/// logical end, to be interpreted on the upgraded protocol if the handler
/// upgrades.
pub type ResourceHandler =
    Arc<dyn Fn(Request, Arc<Connection>, Vec<u8>) -> BoxFuture<'static, Response> + Send + Sync>;

struct Registration {
    id: u64,
    segments: Vec<String>,
    handler: ResourceHandler,
}

type RegistrationTable = Arc<RwLock<Vec<Registration>>>;

pub struct ResourceRouter {
    registrations: RegistrationTable,
    next_id: AtomicU64,
}

impl ResourceRouter {
    pub fn new() -> Self {
        Self {
            registrations: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for the subspace rooted at `segments`.
    pub fn register(&self, segments: &[String], handler: ResourceHandler) -> ResourceRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .write()
            .expect("registration table poisoned")
            .push(Registration {
                id,
                segments: segments.to_vec(),
                handler,
            });
        ResourceRegistration {
            id,
            registrations: Arc::downgrade(&self.registrations),
        }
    }

    /// Dispatch `request` to the longest-prefix registration.
    pub async fn dispatch(
        &self,
        request: Request,
        connection: Arc<Connection>,
        trailer: Vec<u8>,
    ) -> Response {
        let handler = {
            let registrations = self.registrations.read().expect("registration table poisoned");
            let mut best: Option<&Registration> = None;
            for registration in registrations.iter() {
                if !is_prefix(&registration.segments, &request.path) {
                    continue;
                }
                match best {
                    Some(current) if current.segments.len() >= registration.segments.len() => {}
                    _ => best = Some(registration),
                }
            }
            best.map(|registration| Arc::clone(&registration.handler))
        };
        match handler {
            Some(handler) => handler(request, connection, trailer).await,
            None => Response::not_found(),
        }
    }
}

impl Default for ResourceRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn is_prefix(prefix: &[String], path: &[String]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path).all(|(a, b)| a == b)
}

/// Handle returned from [`ResourceRouter::register`].
///
/// `unregister` is idempotent; once it returns, dispatch no longer finds
/// the registration.
pub struct ResourceRegistration {
    id: u64,
    registrations: Weak<RwLock<Vec<Registration>>>,
}

impl ResourceRegistration {
    pub fn unregister(&self) {
        if let Some(registrations) = self.registrations.upgrade() {
            registrations
                .write()
                .expect("registration table poisoned")
                .retain(|registration| registration.id != self.id);
        }
    }
}
