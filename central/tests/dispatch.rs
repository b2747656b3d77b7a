//! End-to-end dispatch behavior over real TCP.

mod support;

use std::time::Duration;

use serde_json::json;

use corral_core::auth::{issue, TokenKind};
use corral_core::protocol::Frame;

use support::{
    node_info_handler, start_central, FakeDaemon, Reply, TestClient, KEY,
};

#[tokio::test(flavor = "multi_thread")]
async fn commands_require_matching_auth_kind() {
    let (addr, _central, _shutdown) = start_central().await;

    // Unauthenticated connections get NoPermission.
    let mut anon = TestClient::connect(&addr).await;
    let response = anon.call("nodes", json!({})).await;
    assert_eq!(response.code, 7);

    // A user token cannot register as a daemon.
    let mut user = TestClient::connect_user(&addr, "alice").await;
    let response = user.call("daemon", json!({})).await;
    assert_eq!(response.code, 7);

    // A daemon token cannot run client commands.
    let mut daemonish = TestClient::connect(&addr).await;
    let token = issue("node-x", TokenKind::Daemon, 3600, KEY).unwrap();
    let response = daemonish.call("auth", json!({ "token": token })).await;
    assert_eq!(response.code, 0);
    let response = daemonish
        .call(
            "run",
            json!({ "name": "j", "image": "i", "exec": ["true"], "n_gpus": 1 }),
        )
        .await;
    assert_eq!(response.code, 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_tokens_are_rejected_with_their_code() {
    let (addr, _central, _shutdown) = start_central().await;

    let mut client = TestClient::connect(&addr).await;
    let response = client.call("auth", json!({ "token": "garbage" })).await;
    assert_eq!(response.code, 3);

    let mut client = TestClient::connect(&addr).await;
    let token = issue("alice", TokenKind::User, 3600, "the-wrong-key").unwrap();
    let response = client.call("auth", json!({ "token": token })).await;
    assert_eq!(response.code, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_commands_answer_on_their_ticket() {
    let (addr, _central, _shutdown) = start_central().await;
    let mut client = TestClient::connect_user(&addr, "alice").await;

    let response = client.call("frobnicate", json!({})).await;
    assert_eq!(response.code, 1);
    assert!(response.fields["msg"]
        .as_str()
        .unwrap()
        .contains("frobnicate"));
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_handlers_do_not_block_other_commands() {
    let (addr, _central, _shutdown) = start_central().await;
    let _daemon = FakeDaemon::spawn(&addr, "node-a", |request| match request.cmd.as_str() {
        "node_info" => Reply::Delayed(
            Duration::from_millis(500),
            json!({ "free_gpu_ids": [], "names": [], "ids": [] }),
        ),
        _ => Reply::Error(-1, "unhandled".into()),
    })
    .await;

    let mut client = TestClient::connect_user(&addr, "alice").await;

    // A (slow broadcast) first, then B (instant failure); B must answer
    // first, and each ticket exactly once.
    client.send("ticket-slow", "nodes", json!({})).await;
    client.send("ticket-fast", "frobnicate", json!({})).await;

    let Frame::Response(first) = client.recv().await else {
        panic!("expected response");
    };
    assert_eq!(first.ticket, "ticket-fast");
    assert_eq!(first.code, 1);

    let Frame::Response(second) = client.recv().await else {
        panic!("expected response");
    };
    assert_eq!(second.ticket, "ticket-slow");
    assert_eq!(second.code, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn nodes_aggregates_by_daemon_name() {
    let (addr, _central, _shutdown) = start_central().await;
    let _a = FakeDaemon::spawn(&addr, "node-a", node_info_handler(vec![0, 1], vec!["job-a"])).await;
    let _b = FakeDaemon::spawn(&addr, "node-b", node_info_handler(vec![4, 5, 6], vec![])).await;

    let mut client = TestClient::connect_user(&addr, "alice").await;
    let response = client.call("nodes", json!({})).await;
    assert_eq!(response.code, 0);
    let nodes = response.fields["nodes"].as_object().unwrap();
    assert_eq!(nodes["node-a"]["free_gpu_ids"], json!([0, 1]));
    assert_eq!(nodes["node-a"]["names"], json!(["job-a"]));
    assert_eq!(nodes["node-b"]["free_gpu_ids"], json!([4, 5, 6]));
}

#[tokio::test(flavor = "multi_thread")]
async fn ps_unions_containers_and_filters() {
    let (addr, _central, _shutdown) = start_central().await;
    let _a = FakeDaemon::spawn(&addr, "node-a", |request| match request.cmd.as_str() {
        "list_containers" => Reply::Body(json!({
            "containers": {
                "aaa111111111": {"gpu_ids": [0], "name": "train-0", "user": "alice",
                                  "status": "running", "node": "node-a"},
            }
        })),
        _ => Reply::Error(-1, "unhandled".into()),
    })
    .await;
    let _b = FakeDaemon::spawn(&addr, "node-b", |request| match request.cmd.as_str() {
        "list_containers" => Reply::Body(json!({
            "containers": {
                "bbb111111111": {"gpu_ids": [2], "name": "eval", "user": "bob",
                                  "status": "running", "node": "node-b"},
            }
        })),
        _ => Reply::Error(-1, "unhandled".into()),
    })
    .await;

    let mut client = TestClient::connect_user(&addr, "alice").await;

    let response = client.call("ps", json!({})).await;
    assert_eq!(response.code, 0);
    let containers = response.fields["containers"].as_object().unwrap();
    assert_eq!(containers.len(), 2);

    // Filter matches on user.
    let response = client.call("ps", json!({ "filt": "bob" })).await;
    let containers = response.fields["containers"].as_object().unwrap();
    assert_eq!(containers.len(), 1);
    assert!(containers.contains_key("bbb111111111"));

    // Filter matches on id prefix substring.
    let response = client.call("ps", json!({ "filt": "aaa" })).await;
    let containers = response.fields["containers"].as_object().unwrap();
    assert_eq!(containers.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn logs_takes_the_first_success() {
    let (addr, _central, _shutdown) = start_central().await;
    let _miss = FakeDaemon::spawn(&addr, "node-a", |request| match request.cmd.as_str() {
        "get_logs" => Reply::Error(-1, "no such container".into()),
        _ => Reply::Error(-1, "unhandled".into()),
    })
    .await;
    let _hit = FakeDaemon::spawn(&addr, "node-b", |request| match request.cmd.as_str() {
        "get_logs" => Reply::Body(json!({ "logs": "hello from node-b" })),
        _ => Reply::Error(-1, "unhandled".into()),
    })
    .await;

    let mut client = TestClient::connect_user(&addr, "alice").await;
    let response = client.call("logs", json!({ "container": "train" })).await;
    assert_eq!(response.code, 0);
    assert_eq!(response.fields["logs"], "hello from node-b");
}

#[tokio::test(flavor = "multi_thread")]
async fn all_failures_report_the_most_common_error() {
    let (addr, _central, _shutdown) = start_central().await;
    for node in ["node-a", "node-b"] {
        let _d = FakeDaemon::spawn(&addr, node, |request| match request.cmd.as_str() {
            "stop_container" => Reply::Error(9, "container `x` already stopped".into()),
            _ => Reply::Error(-1, "unhandled".into()),
        })
        .await;
    }
    let _odd = FakeDaemon::spawn(&addr, "node-c", |request| match request.cmd.as_str() {
        "stop_container" => Reply::Error(-1, "docker exploded".into()),
        _ => Reply::Error(-1, "unhandled".into()),
    })
    .await;

    let mut client = TestClient::connect_user(&addr, "alice").await;
    let response = client.call("stop", json!({ "container": "x" })).await;
    assert_eq!(response.code, 10);
    let msg = response.fields["msg"].as_str().unwrap();
    assert!(msg.contains("9"), "unexpected msg: {msg}");
    assert!(msg.contains("already stopped"), "unexpected msg: {msg}");
}

#[tokio::test(flavor = "multi_thread")]
async fn jstop_without_matching_containers_fails() {
    let (addr, _central, _shutdown) = start_central().await;
    let _a = FakeDaemon::spawn(&addr, "node-a", node_info_handler(vec![0], vec!["other"])).await;

    let mut client = TestClient::connect_user(&addr, "alice").await;
    let response = client.call("jstop", json!({ "job": "train" })).await;
    assert_eq!(response.code, 16);
}

#[tokio::test(flavor = "multi_thread")]
async fn jstop_expands_to_numbered_members() {
    let (addr, _central, _shutdown) = start_central().await;
    let mut daemon = FakeDaemon::spawn(&addr, "node-a", |request| match request.cmd.as_str() {
        "node_info" => Reply::Body(json!({
            "free_gpu_ids": [],
            "names": ["train-0", "train-1", "train-x", "retrain-0"],
            "ids": [],
        })),
        "stop_container" => Reply::Body(json!({})),
        _ => Reply::Error(-1, "unhandled".into()),
    })
    .await;

    let mut client = TestClient::connect_user(&addr, "alice").await;
    let response = client.call("jstop", json!({ "job": "train" })).await;
    assert_eq!(response.code, 0);

    // node_info first, then one stop per numbered member.
    let mut stopped = Vec::new();
    while let Ok(request) =
        tokio::time::timeout(Duration::from_millis(500), daemon.next_request()).await
    {
        if request.cmd == "stop_container" {
            stopped.push(request.arg::<String>("container").unwrap());
        }
    }
    stopped.sort();
    assert_eq!(stopped, vec!["train-0", "train-1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn run_places_jobs_and_fans_out() {
    let (addr, _central, _shutdown) = start_central().await;
    let mut a = FakeDaemon::spawn(&addr, "node-a", node_info_handler(vec![0, 1, 2], vec![])).await;
    let mut b = FakeDaemon::spawn(&addr, "node-b", node_info_handler(vec![5, 6], vec![])).await;

    let mut client = TestClient::connect_user(&addr, "alice").await;
    let response = client
        .call(
            "run",
            json!({
                "name": "train", "image": "pytorch:latest",
                "exec": ["python", "train.py"],
                "n_gpus": 2, "n_jobs": 2,
            }),
        )
        .await;
    assert_eq!(response.code, 0, "run failed: {:?}", response.fields);

    // Each daemon got exactly one run_container with a contiguous pair
    // from its own free list, under a numbered job name.
    let mut names = Vec::new();
    for daemon in [&mut a, &mut b] {
        loop {
            let request = daemon.next_request().await;
            if request.cmd != "run_container" {
                continue;
            }
            let gpus: Vec<u32> = request.arg("gpu_ids").unwrap();
            assert_eq!(gpus.len(), 2);
            assert_eq!(gpus[1], gpus[0] + 1);
            assert_eq!(request.arg::<String>("user").unwrap(), "alice");
            names.push(request.arg::<String>("name").unwrap());
            break;
        }
    }
    names.sort();
    assert_eq!(names, vec!["train-0", "train-1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn run_rejects_existing_names_and_empty_node_sets() {
    let (addr, _central, _shutdown) = start_central().await;
    let _a = FakeDaemon::spawn(&addr, "node-a", node_info_handler(vec![0, 1], vec!["train"])).await;

    let mut client = TestClient::connect_user(&addr, "alice").await;

    let response = client
        .call(
            "run",
            json!({ "name": "train", "image": "i", "exec": ["true"], "n_gpus": 1 }),
        )
        .await;
    assert_eq!(response.code, 14);

    let response = client
        .call(
            "run",
            json!({
                "name": "fresh", "image": "i", "exec": ["true"], "n_gpus": 1,
                "node_exclude": "node-a",
            }),
        )
        .await;
    assert_eq!(response.code, 19);

    let response = client
        .call(
            "run",
            json!({ "name": "fresh", "image": "i", "exec": ["true"], "n_gpus": 3 }),
        )
        .await;
    assert_eq!(response.code, 11);

    let response = client
        .call(
            "run",
            json!({ "name": "fresh", "image": "i", "exec": ["true"], "n_gpus": 16 }),
        )
        .await;
    assert_eq!(response.code, 12);
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_disconnect_is_survivable() {
    let (addr, central, _shutdown) = start_central().await;
    {
        let daemon =
            FakeDaemon::spawn(&addr, "node-a", node_info_handler(vec![0], vec![])).await;
        assert_eq!(central.daemon_entries().len(), 1);
        daemon.close();
    }
    // The registry clears once the connection is gone.
    for _ in 0..50 {
        if central.daemon_entries().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(central.daemon_entries().is_empty());

    // Broadcasts now fail cleanly instead of hanging.
    let mut client = TestClient::connect_user(&addr, "alice").await;
    let response = client.call("logs", json!({ "container": "x" })).await;
    assert_eq!(response.code, 10);
}
