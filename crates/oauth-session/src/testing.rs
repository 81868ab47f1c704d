//! In-memory token endpoint for unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use common::Secret;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Result;
use crate::token::{TokenEndpoint, TokenFuture, TokenResponse};

/// One call the endpoint received. Refreshes carry the (tokio) time they arrived.
#[derive(Debug)]
pub(crate) enum Call {
    Exchange {
        code: String,
        verifier: Option<String>,
    },
    Refresh {
        token: String,
        at: Instant,
    },
}

/// Replays queued results; once a queue is empty every call succeeds with a
/// one-hour token.
pub(crate) struct ScriptedEndpoint {
    exchange: Mutex<VecDeque<Result<TokenResponse>>>,
    refresh: Mutex<VecDeque<Result<TokenResponse>>>,
    refreshes: Mutex<u32>,
    calls: mpsc::UnboundedSender<Call>,
}

impl ScriptedEndpoint {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Self {
            exchange: Mutex::new(VecDeque::new()),
            refresh: Mutex::new(VecDeque::new()),
            refreshes: Mutex::new(0),
            calls,
        });
        (endpoint, rx)
    }

    pub(crate) fn push_exchange(&self, result: Result<TokenResponse>) {
        self.exchange.lock().unwrap().push_back(result);
    }

    pub(crate) fn push_refresh(&self, result: Result<TokenResponse>) {
        self.refresh.lock().unwrap().push_back(result);
    }
}

pub(crate) fn token(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenResponse {
    TokenResponse {
        access_token: Secret::from(access),
        refresh_token: refresh.map(Secret::from),
        expires_in,
        scope: None,
        token_type: Some("Bearer".into()),
    }
}

impl TokenEndpoint for ScriptedEndpoint {
    fn exchange_code<'a>(&'a self, code: &'a str, verifier: Option<&'a str>) -> TokenFuture<'a> {
        Box::pin(async move {
            let _ = self.calls.send(Call::Exchange {
                code: code.to_owned(),
                verifier: verifier.map(str::to_owned),
            });
            self.exchange
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(token("at_exchanged", Some("rt_exchanged"), 3600)))
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a> {
        Box::pin(async move {
            let _ = self.calls.send(Call::Refresh {
                token: refresh_token.to_owned(),
                at: Instant::now(),
            });
            let n = {
                let mut count = self.refreshes.lock().unwrap();
                *count += 1;
                *count
            };
            self.refresh
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(token(&format!("at_refreshed_{n}"), None, 3600)))
        })
    }
}
