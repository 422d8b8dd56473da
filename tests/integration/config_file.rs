// Batches driven from a TOML config file

use crate::common::*;
use std::fs;
use vidproc::config::Config;
use vidproc::engine::{CollisionPolicy, EngineError};

#[test]
fn test_config_file_drives_a_batch() {
    let ws = Workspace::new();
    ws.add_input("a.MOV", 100);
    ws.add_input("b.mp4", 100);
    let path = ws.tmp.path().join("vidproc.toml");
    fs::write(
        &path,
        format!(
            r#"
[encode]
video_codec = "H264"
crf = 28

[batch]
input_dir = "{}"
output_dir = "{}"
extensions = ["MOV"]
workers = 1
collision_policy = "suffix"

[log]
csv_path = "{}"
"#,
            ws.input().display(),
            ws.output().display(),
            ws.csv_path().display()
        ),
    )
    .unwrap();

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.encode.video_codec, "h264");
    assert_eq!(config.batch.extensions, vec![".mov"]);
    assert_eq!(config.batch.collision_policy, CollisionPolicy::Suffix);

    let encoder = StubEncoder::new().into_arc();
    let mut controller = controller(config, encoder.clone());
    let snapshot = run_to_completion(&mut controller);
    assert_eq!(snapshot.total_jobs(), 1);
    assert_eq!(encoder.called_names(), vec!["a.MOV"]);
}

#[test]
fn test_bad_config_file_value_stops_start() {
    let ws = Workspace::new();
    let path = ws.tmp.path().join("vidproc.toml");
    let mut config = ws.config();
    config.encode.audio_codec = "mp3".to_string();
    config.save_to(&path).unwrap();

    let loaded = Config::load_from(&path).unwrap();
    assert_eq!(loaded, config);
    let mut controller = controller(loaded, StubEncoder::new().into_arc());
    let err = controller.start().unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
    assert!(err.to_string().contains("audio_codec"));
}
