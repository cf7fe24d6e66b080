use reliability_test::{tool, CommandExt};

fn adjacency_fixture() -> eyre::Result<tempfile::NamedTempFile> {
    // Minimal diamond: 1 -> 2 -> {3, 4} -> 5
    reliability_test::tempfile("0,1,0,0,0\n0,0,1,1,0\n0,0,0,0,1\n0,0,0,0,1\n0,0,0,0,0\n")
}

#[test]
fn prints_belief_for_every_node() {
    let adjacency = adjacency_fixture().unwrap();

    let output = tool!("reliability")
        .arg(adjacency.path())
        .captured_output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("1: "));
    assert!(lines[4].starts_with("5: "));
}

#[test]
fn minimal_diamond_belief_matches_closed_form() {
    let adjacency = adjacency_fixture().unwrap();
    let edge_probs = reliability_test::tempfile(
        r#"{"1": {"2": 0.9}, "2": {"3": 0.9, "4": 0.9}, "3": {"5": 0.9}, "4": {"5": 0.9}}"#,
    )
    .unwrap();

    let output = tool!("reliability")
        .arg(adjacency.path())
        .arg("--edge-probs")
        .arg(edge_probs.path())
        .captured_output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let node_five = stdout
        .lines()
        .find(|line| line.starts_with("5: "))
        .expect("node 5 has a belief line");
    let belief: f64 = node_five.trim_start_matches("5: ").parse().unwrap();

    let expected = 2.0 * 0.9f64.powi(3) - 0.9f64.powi(6);
    assert!((belief - expected).abs() < 1e-9, "got {belief}");
}

#[test]
fn json_output_is_a_flat_object() {
    let adjacency = adjacency_fixture().unwrap();

    let output = tool!("reliability")
        .arg(adjacency.path())
        .arg("--json")
        .captured_output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(parsed.get("5").is_some());
}

#[test]
fn sequential_and_parallel_agree_on_chained_diamonds() {
    let adjacency = reliability_test::tempfile(
        "0,1,0,0,0,0,0,0,0,0\n\
         0,0,1,1,0,0,0,0,0,0\n\
         0,0,0,0,1,0,0,0,0,0\n\
         0,0,0,0,1,0,0,0,0,0\n\
         0,0,0,0,0,1,0,1,0,0\n\
         0,0,0,0,0,0,1,0,0,0\n\
         0,0,0,0,0,0,0,0,0,1\n\
         0,0,0,0,0,0,0,0,1,0\n\
         0,0,0,0,0,0,0,0,0,1\n\
         0,0,0,0,0,0,0,0,0,0\n",
    )
    .unwrap();

    let sequential = tool!("reliability").arg(adjacency.path()).captured_output().unwrap();
    let parallel = tool!("reliability")
        .arg(adjacency.path())
        .arg("--parallel")
        .captured_output()
        .unwrap();

    assert!(sequential.status.success());
    assert!(parallel.status.success());
    assert_eq!(sequential.stdout, parallel.stdout);
}
