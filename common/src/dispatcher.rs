use std::{
    collections::HashMap,
    fmt::Write as _,
    io::{self, BufReader},
    time::Duration,
};

use thiserror::Error;

use crate::{
    config::RequestLimits,
    http::{ProtocolError, Request, Response},
    net::{Connection, Listener},
};

pub trait Handler<C> {
    fn handle(&self, context: &mut C, request: &Request, response: &mut Response);
}

impl<C, F> Handler<C> for F
where
    F: Fn(&mut C, &Request, &mut Response),
{
    fn handle(&self, context: &mut C, request: &Request, response: &mut Response) {
        self(context, request, response)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl<C> Handler<C> for EchoHandler {
    fn handle(&self, _context: &mut C, request: &Request, response: &mut Response) {
        response.set_status(200);
        let _ = writeln!(response, "method: {}", request.method());
        let _ = writeln!(response, "path: {}", request.path());
        let _ = writeln!(response, "object: {}", request.object());
        let _ = writeln!(response, "version: {}", request.version());
        let _ = writeln!(response);
        for (key, value) in request.options() {
            let _ = writeln!(response, "{key} -> {value}");
        }
        let _ = writeln!(response);
        response.write_bytes(request.body());
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("waiting for request data failed: {0}")]
    Wait(#[source] io::Error),
    #[error("writing reply failed: {0}")]
    Reply(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Idle,
    TimedOut,
    Abandoned,
    Rejected(String),
    Served {
        path: String,
        status: u16,
        routed: bool,
    },
}

pub struct Dispatcher<C> {
    routes: HashMap<String, Box<dyn Handler<C> + Send>>,
    fallback: Option<Box<dyn Handler<C> + Send>>,
    limits: RequestLimits,
    data_wait: Duration,
}

impl<C> Dispatcher<C> {
    pub fn new(limits: RequestLimits, data_wait: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            fallback: None,
            limits,
            data_wait,
        }
    }

    pub fn register_handler<H>(&mut self, path: impl Into<String>, handler: H)
    where
        H: Handler<C> + Send + 'static,
    {
        self.routes.insert(path.into(), Box::new(handler));
    }

    pub fn set_fallback<H>(&mut self, handler: H)
    where
        H: Handler<C> + Send + 'static,
    {
        self.fallback = Some(Box::new(handler));
    }

    pub fn clear_fallback(&mut self) {
        self.fallback = None;
    }

    pub fn has_route(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn dispatch(&self, context: &mut C, request: &Request) -> (Response, bool) {
        let mut response = Response::new();
        match self.routes.get(request.path()) {
            Some(handler) => {
                handler.handle(context, request, &mut response);
                (response, true)
            }
            None => {
                match &self.fallback {
                    Some(fallback) => fallback.handle(context, request, &mut response),
                    None => response.set_status(404),
                }
                (response, false)
            }
        }
    }

    pub fn accept_and_dispatch<L: Listener>(
        &self,
        listener: &mut L,
        context: &mut C,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(connection) = listener.poll_accept().map_err(DispatchError::Accept)? else {
            return Ok(DispatchOutcome::Idle);
        };
        self.serve(connection, context)
    }

    pub fn serve<T: Connection>(
        &self,
        mut connection: T,
        context: &mut C,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !connection
            .wait_readable(self.data_wait)
            .map_err(DispatchError::Wait)?
        {
            return Ok(if connection.is_open() {
                DispatchOutcome::TimedOut
            } else {
                DispatchOutcome::Abandoned
            });
        }

        let parsed = {
            let mut reader = BufReader::new(&mut connection);
            Request::read_from(&mut reader, &self.limits)
        };

        let request = match parsed {
            Ok(request) => request,
            Err(ProtocolError::Empty) => return Ok(DispatchOutcome::Abandoned),
            Err(err) => {
                let mut response = Response::with_status(400);
                let _ = writeln!(response, "{err}");
                response
                    .write_to(&mut connection)
                    .map_err(DispatchError::Reply)?;
                return Ok(DispatchOutcome::Rejected(err.to_string()));
            }
        };

        let (response, routed) = self.dispatch(context, &request);
        response
            .write_to(&mut connection)
            .map_err(DispatchError::Reply)?;

        Ok(DispatchOutcome::Served {
            path: request.path().to_string(),
            status: response.status(),
            routed,
        })
    }
}
