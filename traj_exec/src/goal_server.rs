//! # Goal Server
//!
//! Exposes the [`GoalCoordinator`] to trajectory clients over a zmq `REP` socket. Every request
//! gets exactly one response.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, warn};
use std::collections::VecDeque;

use comms_if::{
    goal::{GoalId, GoalRequest, GoalResponse},
    net::{self, zmq, NetError, SocketOptions},
};

use crate::coordinator::{GoalCoordinator, GoalHandle};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Maximum number of goals whose status can be queried.
pub const MAX_TRACKED_GOALS: usize = 256;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Goal server
pub struct GoalServer {
    socket: zmq::Socket,

    /// Goals in submission order, oldest first.
    goals: VecDeque<GoalHandle>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GoalServerError {
    #[error("Goal socket error: {0}")]
    SocketError(#[from] NetError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl GoalServer {
    /// Bind a new goal server to the endpoint.
    ///
    /// `recv_timeout_ms` bounds how long [`GoalServer::serve_once`] blocks.
    pub fn new(
        ctx: &zmq::Context,
        endpoint: &str,
        recv_timeout_ms: i32,
    ) -> Result<Self, GoalServerError> {
        let socket_options = SocketOptions {
            bind: true,
            linger: 1,
            recv_timeout: recv_timeout_ms,
            send_timeout: 100,
            ..Default::default()
        };

        let socket = net::create_socket(ctx, zmq::REP, &socket_options, endpoint)?;

        Ok(Self {
            socket,
            goals: VecDeque::new(),
        })
    }

    /// Serve at most one request.
    ///
    /// Returns `Ok(false)` if no request arrived before the receive timeout.
    pub fn serve_once(&mut self, coordinator: &GoalCoordinator) -> Result<bool, GoalServerError> {
        let request_str = match net::recv_string(&self.socket) {
            Ok(Some(s)) => s,
            Ok(None) => return Ok(false),
            Err(NetError::NonUtf8Message) => {
                net::send_json(
                    &self.socket,
                    &GoalResponse::Invalid("Request was not valid UTF-8".into()),
                )?;
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        let response = match GoalRequest::from_json(&request_str) {
            Ok(request) => self.handle(request, coordinator),
            Err(e) => {
                warn!("Could not parse goal request: {}", e);
                GoalResponse::Invalid(e.to_string())
            }
        };

        net::send_json(&self.socket, &response)?;

        Ok(true)
    }

    /// Number of goals currently tracked.
    pub fn num_tracked(&self) -> usize {
        self.goals.len()
    }

    fn handle(&mut self, request: GoalRequest, coordinator: &GoalCoordinator) -> GoalResponse {
        match request {
            GoalRequest::Submit(goal) => {
                let gh = GoalHandle::new(goal);
                self.track(gh.clone());

                coordinator.on_goal(&gh);

                GoalResponse::Submitted {
                    goal_id: gh.id(),
                    status: gh.status(),
                }
            }
            GoalRequest::Cancel { goal_id } => match self.find(goal_id) {
                Some(gh) => {
                    coordinator.on_cancel(&gh);
                    GoalResponse::Status {
                        goal_id,
                        status: gh.status(),
                    }
                }
                None => GoalResponse::UnknownGoal { goal_id },
            },
            GoalRequest::Status { goal_id } => match self.find(goal_id) {
                Some(gh) => GoalResponse::Status {
                    goal_id,
                    status: gh.status(),
                },
                None => GoalResponse::UnknownGoal { goal_id },
            },
        }
    }

    fn find(&self, goal_id: GoalId) -> Option<GoalHandle> {
        self.goals.iter().find(|g| g.id() == goal_id).cloned()
    }

    /// Track a new goal, evicting the oldest finished goal (or the oldest goal) if full.
    fn track(&mut self, gh: GoalHandle) {
        if self.goals.len() >= MAX_TRACKED_GOALS {
            let evict = self
                .goals
                .iter()
                .position(|g| g.is_terminal())
                .unwrap_or(0);

            if let Some(old) = self.goals.remove(evict) {
                debug!("No longer tracking goal {}", old.id());
            }
        }

        self.goals.push_back(gh);
    }
}
