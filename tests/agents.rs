mod common;

use common::*;

fn fixture() -> Fixture {
    Fixture::new(
        vec![
            MemoryAgent::new("sdw2"),
            MemoryAgent::new("cdw"),
            MemoryAgent::new("sdw1"),
        ],
        MemoryCatalog::default(),
    )
}

#[tokio::test]
async fn test_stop_and_status_agents() {
    let fixture = fixture();

    let statuses = fixture.hub.status_agents().await.unwrap();
    let hosts: Vec<&str> = statuses.iter().map(|s| s.host.as_str()).collect();
    assert_eq!(hosts, vec!["cdw", "sdw1", "sdw2"]);

    // The in-memory agents drop their channel on stop
    fixture.hub.stop_agents().await.unwrap();
    assert!(fixture.hub.connections().connections().await.is_empty());
}

#[tokio::test]
async fn test_get_all_hostnames() {
    let fixture = fixture();

    let names = fixture
        .hub
        .get_all_hostnames(&["sdw1".to_string(), "cdw".to_string()])
        .await
        .unwrap();
    assert_eq!(names["sdw1"], "sdw1");
    assert_eq!(names["cdw"], "cdw");

    let err = fixture
        .hub
        .get_all_hostnames(&["sdw9".to_string()])
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "could not connect to agent on host sdw9: no route to host"
    );
}
