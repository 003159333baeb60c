use encode_queue::{
    CommandBuilder, ConversionOptions, Error, MediaInfo, TargetProfile, Task, TaskQueue,
};
use std::fs;
use std::path::{Path, PathBuf};

fn mp4_profile() -> TargetProfile {
    TargetProfile::new("MP4", "mp4")
        .preset("H.264 High", ["-c:v", "libx264", "-crf", "20"])
        .preset("H.264 Fast", ["-c:v", "libx264", "-preset", "veryfast"])
}

#[test]
fn test_command_builder_basic_args() {
    let builder = CommandBuilder::new("/usr/bin/ffmpeg", "/path/to/input.mkv", "/path/to/output.mp4");
    let args = builder.build_args();

    assert_eq!(args, vec!["-i", "/path/to/input.mkv", "-y", "/path/to/output.mp4"]);
}

#[test]
fn test_command_builder_with_params_and_threads() {
    let builder = CommandBuilder::new("/usr/bin/ffmpeg", "input.mkv", "output.mp4")
        .params(["-c:v", "libx264"])
        .threads(3);
    let args = builder.build_args();

    assert_eq!(
        args,
        vec![
            "-i",
            "input.mkv",
            "-c:v",
            "libx264",
            "-threads",
            "3",
            "-y",
            "output.mp4",
        ]
    );
}

#[test]
fn test_command_builder_with_subtitle() {
    let builder = CommandBuilder::new("/usr/bin/ffmpeg", "input.mkv", "output.mp4")
        .subtitle_file("/subs/input.srt")
        .params(["-c:v", "libx264"]);
    let args = builder.build_args();

    assert_eq!(
        args,
        vec![
            "-i",
            "input.mkv",
            "-vf",
            r"subtitles=/subs/input.srt",
            "-c:v",
            "libx264",
            "-y",
            "output.mp4",
        ]
    );
}

#[test]
fn test_command_builder_last_call_wins() {
    let builder = CommandBuilder::new("/usr/bin/ffmpeg", "input.mkv", "output.mp4")
        .params(["-c:v", "libx264"])
        .params(["-c:v", "libx265"])
        .threads(2)
        .threads(8)
        .overwrite(false);
    let args = builder.build_args();

    assert_eq!(
        args,
        vec![
            "-i",
            "input.mkv",
            "-c:v",
            "libx265",
            "-threads",
            "8",
            "-n",
            "output.mp4",
        ]
    );
}

#[test]
fn test_command_builder_build_keeps_program_and_output() {
    let command = CommandBuilder::new("/opt/ffmpeg/bin/ffmpeg", "in.avi", "/out/in.mp4").build();

    assert_eq!(command.program, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    assert_eq!(command.output, PathBuf::from("/out/in.mp4"));
    assert_eq!(command.args.last().map(String::as_str), Some("/out/in.mp4"));
}

fn queue_with_source(dir: &Path, quality: &str) -> (TaskQueue, PathBuf) {
    let source = dir.join("holiday.mkv");
    fs::write(&source, b"not really a video").unwrap();
    let subtitle = dir.join("holiday.srt");
    fs::write(&subtitle, b"1\n00:00:01,000 --> 00:00:02,000\nhi\n").unwrap();

    let mut queue = TaskQueue::new();
    let task = Task::new(&source, MediaInfo::new(120.0), mp4_profile(), quality).with_subtitle(&subtitle);
    queue.add_task(task).unwrap();
    (queue, subtitle)
}

#[test]
fn test_conversion_command_from_queue() {
    let source_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let (queue, subtitle) = queue_with_source(source_dir.path(), "H.264 Fast");

    let options = ConversionOptions {
        output_dir: output_dir.path(),
        tagged: true,
        subtitle: true,
        threads: 2,
    };
    let command = queue
        .build_conversion_command(0, Path::new("ffmpeg"), options)
        .unwrap();

    let expected_output = output_dir.path().join("holiday_MP4.mp4");
    assert_eq!(command.output, expected_output);
    assert_eq!(
        command.args,
        vec![
            "-i".to_string(),
            source_dir.path().join("holiday.mkv").display().to_string(),
            "-vf".to_string(),
            format!("subtitles={}", subtitle.display()),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-threads".to_string(),
            "2".to_string(),
            "-y".to_string(),
            expected_output.display().to_string(),
        ]
    );

    // same inputs, same command
    let again = queue
        .build_conversion_command(0, Path::new("ffmpeg"), options)
        .unwrap();
    assert_eq!(command, again);
    assert!(!expected_output.exists(), "building a command must not touch the output");
}

#[test]
fn test_conversion_command_skips_subtitle_when_disabled() {
    let source_dir = tempfile::tempdir().unwrap();
    let (queue, _) = queue_with_source(source_dir.path(), "H.264 High");

    let options = ConversionOptions {
        output_dir: source_dir.path(),
        tagged: false,
        subtitle: false,
        threads: 1,
    };
    let command = queue
        .build_conversion_command(0, Path::new("ffmpeg"), options)
        .unwrap();

    assert!(!command.args.iter().any(|a| a == "-vf"));
    assert_eq!(command.output, source_dir.path().join("holiday.mp4"));
}

#[test]
fn test_conversion_command_rejects_missing_output_dir() {
    let source_dir = tempfile::tempdir().unwrap();
    let (queue, _) = queue_with_source(source_dir.path(), "H.264 High");

    let missing = source_dir.path().join("no-such-dir");
    let options = ConversionOptions {
        output_dir: &missing,
        tagged: false,
        subtitle: false,
        threads: 1,
    };
    let result = queue.build_conversion_command(0, Path::new("ffmpeg"), options);

    assert!(matches!(result, Err(Error::InvalidOutputTarget { .. })));
}

#[test]
fn test_conversion_command_rejects_overwriting_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("clip.mp4");
    fs::write(&source, b"data").unwrap();

    let mut queue = TaskQueue::new();
    queue
        .add_task(Task::new(&source, MediaInfo::new(5.0), mp4_profile(), "H.264 High"))
        .unwrap();

    let options = ConversionOptions {
        output_dir: dir.path(),
        tagged: false,
        subtitle: false,
        threads: 1,
    };
    let result = queue.build_conversion_command(0, Path::new("ffmpeg"), options);

    assert!(matches!(result, Err(Error::InvalidOutputTarget { .. })));
}

#[test]
fn test_conversion_command_rejects_unknown_quality() {
    let source_dir = tempfile::tempdir().unwrap();
    let (queue, _) = queue_with_source(source_dir.path(), "Ultra");

    let options = ConversionOptions {
        output_dir: source_dir.path(),
        tagged: false,
        subtitle: false,
        threads: 1,
    };
    let result = queue.build_conversion_command(0, Path::new("ffmpeg"), options);

    assert!(matches!(
        result,
        Err(Error::UnknownQuality { ref quality, .. }) if quality == "Ultra"
    ));
}

#[cfg(unix)]
#[test]
fn test_conversion_command_rejects_unwritable_output_dir() {
    use nix::unistd::{AccessFlags, access};
    use std::os::unix::fs::PermissionsExt;

    let source_dir = tempfile::tempdir().unwrap();
    let (queue, _) = queue_with_source(source_dir.path(), "H.264 High");

    let locked = source_dir.path().join("locked");
    fs::create_dir(&locked).unwrap();
    // group and others may write, the owner may not
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o577)).unwrap();
    assert!(!fs::metadata(&locked).unwrap().permissions().readonly());

    if access(&locked, AccessFlags::W_OK).is_ok() {
        // root ignores mode bits
        println!("Skipping test: the current user can write to read-only directories.");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let options = ConversionOptions {
        output_dir: &locked,
        tagged: false,
        subtitle: false,
        threads: 1,
    };
    let result = queue.build_conversion_command(0, Path::new("ffmpeg"), options);
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    assert!(matches!(
        result,
        Err(Error::InvalidOutputTarget { ref reason, .. }) if reason.contains("not writable")
    ));
}
