use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use hw_jpeg::driver::{self, EncodeOptions, ResolutionChange, StopReason};
use hw_jpeg::nv12_test_pattern;
use rstest::rstest;

fn write_frames(path: &Path, width: usize, height: usize, count: usize) {
    let data = (0..count)
        .flat_map(|i| nv12_test_pattern(width, height, (i * 37) as u8))
        .collect::<Vec<_>>();
    fs::write(path, data).expect("input should be writable");
}

fn jpeg_names(dir: &Path) -> Vec<String> {
    let mut names = fs::read_dir(dir)
        .expect("output dir should be readable")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".jpg"))
        .collect::<Vec<_>>();
    names.sort();
    names
}

fn options_in(dir: &Path, input: PathBuf, width: u16, height: u16) -> EncodeOptions {
    let mut options = EncodeOptions::new(input, width, height);
    options.output_dir = dir.to_path_buf();
    options
}

#[test]
fn e2e_four_frames_stop_after_three_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.nv12");
    write_frames(&input, 320, 240, 4);

    let summary = driver::run(&options_in(dir.path(), input, 320, 240))
        .expect("encode should succeed");

    assert_eq!(summary.frames_written, 3);
    assert_eq!(summary.stop_reason, StopReason::FrameLimit);
    assert_eq!(jpeg_names(dir.path()), ["frame1.jpg", "frame2.jpg", "frame3.jpg"]);
    for path in &summary.outputs {
        let bytes = fs::read(path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(image::image_dimensions(path).unwrap(), (320, 240));
    }
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(320 * 240)]
fn e2e_short_input_writes_nothing(#[case] len: usize) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("short.nv12");
    fs::write(&input, vec![0x80; len]).unwrap();

    let summary = driver::run(&options_in(dir.path(), input, 320, 240))
        .expect("short input should drain cleanly");

    assert_eq!(summary.frames_written, 0);
    assert_eq!(summary.stop_reason, StopReason::Drained);
    assert!(jpeg_names(dir.path()).is_empty());
}

#[rstest]
#[case(1, 3)]
#[case(2, 5)]
#[case(5, 5)]
fn e2e_names_are_consecutive_and_match_count(#[case] frames: usize, #[case] max_frames: u32) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.nv12");
    write_frames(&input, 48, 32, frames);

    let mut options = options_in(dir.path(), input, 48, 32);
    options.max_frames = Some(max_frames);
    let summary = driver::run(&options).expect("encode should succeed");

    let expected = frames.min(max_frames as usize);
    assert_eq!(summary.frames_written as usize, expected);
    let names = jpeg_names(dir.path());
    assert_eq!(names.len(), expected);
    for k in 1..=expected {
        assert!(names.contains(&format!("frame{k}.jpg")));
    }
}

#[test]
fn e2e_resolution_reset_switches_geometry_and_input() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.nv12");
    let second = dir.path().join("second.nv12");
    write_frames(&first, 320, 240, 3);
    write_frames(&second, 64, 48, 3);

    let mut options = options_in(dir.path(), first, 320, 240);
    options.resolution_change = Some(ResolutionChange {
        after_frames: 1,
        width: 64,
        height: 48,
        input: Some(second),
    });
    let summary = driver::run(&options).expect("encode with reset should succeed");

    assert_eq!(summary.resets, 1);
    assert_eq!(summary.frames_written, 3);
    assert_eq!(summary.frame_info.crop_w, 64);
    assert_eq!(summary.frame_info.crop_h, 48);
    let dims = summary
        .outputs
        .iter()
        .map(|path| image::image_dimensions(path).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(dims, [(320, 240), (64, 48), (64, 48)]);
}

#[test]
fn e2e_missing_input_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = driver::run(&options_in(dir.path(), dir.path().join("absent.nv12"), 64, 48))
        .unwrap_err();
    assert!(matches!(err, driver::DriverError::Io { .. }));
    assert!(jpeg_names(dir.path()).is_empty());
}

fn legacy_encode(dir: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_legacy-encode"));
    command.current_dir(dir).env_remove("RUST_LOG");
    command
}

#[test]
fn e2e_cli_default_run_writes_three_frames() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(&dir.path().join("input.nv12"), 320, 240, 4);

    let output = legacy_encode(dir.path())
        .args(["-i", "input.nv12", "-w", "320", "-h", "240", "-f", "25", "-q", "90"])
        .output()
        .expect("binary should start");

    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Encoded 3 frames"));
    assert_eq!(jpeg_names(dir.path()), ["frame1.jpg", "frame2.jpg", "frame3.jpg"]);
}

#[rstest]
#[case(&["-w", "320", "-h", "240"])]
#[case(&["-i", "input.nv12", "-w", "320"])]
#[case(&["-i", "input.nv12", "-w", "0", "-h", "240"])]
#[case(&["-i", "input.nv12", "-w", "320", "-h", "240", "--backend", "gpu"])]
fn e2e_cli_usage_errors_exit_one(#[case] args: &[&str]) {
    let dir = tempfile::tempdir().unwrap();
    write_frames(&dir.path().join("input.nv12"), 320, 240, 1);

    let output = legacy_encode(dir.path())
        .args(args)
        .output()
        .expect("binary should start");

    assert_eq!(output.status.code(), Some(1));
    assert!(jpeg_names(dir.path()).is_empty());
}

#[test]
fn e2e_cli_hardware_only_fails_with_flag() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(&dir.path().join("input.nv12"), 64, 48, 2);

    let output = legacy_encode(dir.path())
        .args(["-i", "input.nv12", "-w", "64", "-h", "48", "--backend", "hw"])
        .output()
        .expect("binary should start");

    assert_eq!(output.status.code(), Some(255));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no implementations meet selection criteria"));
    assert!(jpeg_names(dir.path()).is_empty());
}

#[test]
fn e2e_cli_help_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = legacy_encode(dir.path())
        .arg("--help")
        .output()
        .expect("binary should start");
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("-i <INPUT>"));
}
