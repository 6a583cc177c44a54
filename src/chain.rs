//! Reverse-fold chain composition shared by both engines.
//!
//! Middlewares, emit wrappers and interceptors all have the same shape: a
//! link receives the value under processing plus a `next` continuation and
//! returns a future. [`compose`] folds a registration-ordered list in
//! reverse around a terminal so that the FIRST registered link runs
//! OUTERMOST -- i.e. execution order equals registration order on the way
//! in, and the mirror image on the way out.

use futures::future::BoxFuture;
use std::sync::Arc;

/// A continuation taking the current value to the rest of the chain.
pub type Tail<C, R> = Arc<dyn Fn(C) -> BoxFuture<'static, R> + Send + Sync>;

/// One chain link wrapping a [`Tail`].
pub type Link<C, R> = Arc<dyn Fn(C, Tail<C, R>) -> BoxFuture<'static, R> + Send + Sync>;

/// Fold `links` in reverse registration order around `terminal`.
pub fn compose<C, R>(links: &[Link<C, R>], terminal: Tail<C, R>) -> Tail<C, R>
where
    C: 'static,
    R: 'static,
{
    let mut chain = terminal;
    for link in links.iter().rev() {
        let link = Arc::clone(link);
        let next = chain;
        chain = Arc::new(move |value| link(value, Arc::clone(&next)));
    }
    chain
}
