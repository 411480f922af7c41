//! Goal server tests over an in-process zmq socket.

mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use comms_if::{
    goal::{GoalId, GoalRequest, GoalResponse, GoalResult, GoalStatus},
    net::{self, zmq, SocketOptions},
};
use traj_lib::goal_server::GoalServer;

use common::{coordinator_params, driver, goal};

/// Send a raw string request and wait for the reply.
fn raw_request(socket: &zmq::Socket, req: &str) -> GoalResponse {
    socket.send(req, 0).unwrap();
    net::recv_json(socket).unwrap().unwrap()
}

fn request(socket: &zmq::Socket, req: &GoalRequest) -> GoalResponse {
    raw_request(socket, &serde_json::to_string(req).unwrap())
}

#[test]
fn test_goal_requests() {
    let d = driver(coordinator_params());

    let ctx = zmq::Context::new();
    let endpoint = "inproc://test_goal_requests";
    let mut server = GoalServer::new(&ctx, endpoint, 10).unwrap();

    // The client runs on its own thread, the server stays on the admission thread
    let client_ctx = ctx.clone();
    let client = thread::spawn(move || {
        let socket = net::create_socket(
            &client_ctx,
            zmq::REQ,
            &SocketOptions {
                linger: 0,
                recv_timeout: 5000,
                ..Default::default()
            },
            endpoint,
        )
        .unwrap();

        let mut responses = Vec::new();

        // A long goal which will still be running when it is cancelled
        let submitted = request(&socket, &GoalRequest::Submit(goal(&[(0.2, 5.0)])));
        let goal_id: GoalId = match submitted {
            GoalResponse::Submitted { goal_id, ref status } => {
                assert!(!status.is_terminal());
                goal_id
            }
            ref r => panic!("Expected a submitted response, got {:?}", r),
        };
        responses.push(submitted);

        responses.push(request(&socket, &GoalRequest::Status { goal_id }));
        responses.push(request(
            &socket,
            &GoalRequest::Status {
                goal_id: goal_id + 1000,
            },
        ));
        responses.push(raw_request(&socket, "{\"Launch\": 1}"));

        let mut bad_joints = goal(&[(0.1, 1.0)]);
        bad_joints.trajectory.joint_names.pop();
        responses.push(request(&socket, &GoalRequest::Submit(bad_joints)));

        responses.push(request(&socket, &GoalRequest::Cancel { goal_id }));

        (goal_id, responses)
    });

    let start = Instant::now();
    let mut served = 0;
    while served < 6 && start.elapsed() < Duration::from_secs(10) {
        if server.serve_once(&d.coordinator).unwrap() {
            served += 1;
        }
    }

    let (goal_id, responses) = client.join().unwrap();
    assert_eq!(server.num_tracked(), 2);

    assert!(matches!(
        responses[1],
        GoalResponse::Status { goal_id: id, .. } if id == goal_id
    ));
    assert_eq!(
        responses[2],
        GoalResponse::UnknownGoal {
            goal_id: goal_id + 1000
        }
    );
    assert!(matches!(responses[3], GoalResponse::Invalid(_)));

    match &responses[4] {
        GoalResponse::Submitted {
            status: GoalStatus::Rejected(r),
            ..
        } => assert_eq!(r.error_code, GoalResult::INVALID_JOINTS),
        r => panic!("Expected a rejected goal, got {:?}", r),
    }

    assert_eq!(
        responses[5],
        GoalResponse::Status {
            goal_id,
            status: GoalStatus::Canceled(GoalResult::internal("Goal cancelled by client"))
        }
    );
}

#[test]
fn test_no_request_times_out() {
    let d = driver(coordinator_params());

    let ctx = zmq::Context::new();
    let mut server = GoalServer::new(&ctx, "inproc://test_no_request_times_out", 10).unwrap();

    assert!(!server.serve_once(&d.coordinator).unwrap());
    assert_eq!(server.num_tracked(), 0);
}
