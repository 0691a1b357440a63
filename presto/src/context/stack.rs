//! The thread-local current-context stack.
//!
//! Frames are reference-counted rather than raw-pushed so that re-entrant
//! pushes of the already-current context nest: the inner pop leaves the
//! context current, the outer pop restores the previous frame.

use std::cell::RefCell;
use std::marker::PhantomData;

use super::{ClientRequestContext, ServerContext};
use crate::error::{Error, ErrorKind};

/// Either side of a request scope.
#[derive(Debug, Clone)]
pub enum RequestContext {
    Client(ClientRequestContext),
    Server(ServerContext),
}

impl RequestContext {
    fn same(&self, other: &RequestContext) -> bool {
        match (self, other) {
            (RequestContext::Client(a), RequestContext::Client(b)) => a.same(b),
            (RequestContext::Server(a), RequestContext::Server(b)) => a.same(b),
            _ => false,
        }
    }
}

struct Frame {
    ctx: RequestContext,
    refs: usize,
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pops its frame (or one reference of it) when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    ctx: RequestContext,
    // Guards must be dropped on the thread that created them.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(top) = stack.last_mut() {
                if top.ctx.same(&self.ctx) {
                    top.refs -= 1;
                    if top.refs == 0 {
                        stack.pop();
                    }
                }
            }
        });
    }
}

pub(super) fn push(ctx: RequestContext) -> Result<ContextGuard, Error> {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();

        if let Some(top) = stack.last_mut() {
            if top.ctx.same(&ctx) {
                top.refs += 1;
                return Ok(ContextGuard {
                    ctx,
                    _not_send: PhantomData,
                });
            }
        }

        if let RequestContext::Client(client) = &ctx {
            match stack.last().map(|f| &f.ctx) {
                None => {}
                Some(RequestContext::Server(server)) => {
                    let root_matches = client.root().is_some_and(|r| r.same(server));
                    if !root_matches {
                        return Err(Error::new(ErrorKind::IllegalState).with(
                            "cannot push a client context under a server context \
                             that is not its root",
                        ));
                    }
                }
                Some(RequestContext::Client(current)) => {
                    if !client.roots_match(current) {
                        return Err(Error::new(ErrorKind::IllegalState).with(
                            "cannot push a client context under a client context \
                             with a different root",
                        ));
                    }
                }
            }
        }

        stack.push(Frame { ctx: ctx.clone(), refs: 1 });
        Ok(ContextGuard {
            ctx,
            _not_send: PhantomData,
        })
    })
}

/// The current client context.
///
/// Fails with `IllegalState` when nothing is pushed, or when the current
/// frame is a server-side context.
pub fn current() -> Result<ClientRequestContext, Error> {
    STACK.with(|stack| match stack.borrow().last().map(|f| &f.ctx) {
        Some(RequestContext::Client(ctx)) => Ok(ctx.clone()),
        Some(RequestContext::Server(_)) => Err(Error::new(ErrorKind::IllegalState)
            .with("the current context is not a client-side context")),
        None => Err(Error::new(ErrorKind::IllegalState).with("no current context")),
    })
}

/// The current context of either kind, or `None` when nothing is pushed.
pub fn current_or_null() -> Option<RequestContext> {
    STACK.with(|stack| stack.borrow().last().map(|f| f.ctx.clone()))
}

/// The server scope a context created right now would get as its root:
/// the current server context, or the root of the current client context.
pub(super) fn ambient_root() -> Option<ServerContext> {
    STACK.with(|stack| match stack.borrow().last().map(|f| &f.ctx) {
        Some(RequestContext::Server(server)) => Some(server.clone()),
        Some(RequestContext::Client(client)) => client.root().cloned(),
        None => None,
    })
}
