//
// handler.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! An ordered chain of operation handlers.
//!
//! Collaborators can insert handlers ahead of the transport to observe or
//! intercept operations before the transport acts on them. Dispatch walks
//! the chain in order; the first handler that claims an operation stops it
//! from reaching the transport.

/// An operation about to be performed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation<'a> {
    Execute { code: &'a str },
    Complete { code: &'a str, cursor_pos: usize },
    Inspect { code: &'a str, cursor_pos: usize },
    InputReply { value: &'a str },
    Interrupt,
    Shutdown,
    Restart,
}

/// A handler's verdict on an operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Pass the operation along to the next handler, or to the transport
    /// itself if this is the last handler
    Pass,

    /// The operation has been fully handled; the transport takes no action
    Handled,
}

/// One link in the handler chain. Handlers typically care about a subset of
/// operations; the default implementation passes everything through.
pub trait KernelHandler: Send + Sync {
    /// A name for the handler, used in logging.
    fn name(&self) -> &str;

    fn handle(&self, _operation: &Operation) -> Disposition {
        Disposition::Pass
    }
}

/// The ordered list of handlers consulted before each transport operation.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn KernelHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        HandlerChain {
            handlers: Vec::new(),
        }
    }

    /// Append a handler to the end of the chain.
    pub fn push(&mut self, handler: Box<dyn KernelHandler>) {
        self.handlers.push(handler);
    }

    /// Insert a handler ahead of all existing handlers.
    pub fn push_front(&mut self, handler: Box<dyn KernelHandler>) {
        self.handlers.insert(0, handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Offer an operation to each handler in order. Returns
    /// [`Disposition::Handled`] if any handler claimed it.
    pub fn dispatch(&self, operation: &Operation) -> Disposition {
        for handler in &self.handlers {
            if handler.handle(operation) == Disposition::Handled {
                log::debug!("Operation {:?} handled by {}", operation, handler.name());
                return Disposition::Handled;
            }
        }
        Disposition::Pass
    }
}
