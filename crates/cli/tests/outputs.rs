use std::io::Write;
use std::process::Command;

fn write_temp_file(name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("labwired-cli-test-{}-{name}", std::process::id()));
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(bytes).unwrap();
    path
}

#[test]
fn runs_a_chip8_rom_for_the_requested_tick_count() {
    // JP 0x200: an infinite loop, harmless for a bounded tick count.
    let rom = write_temp_file("loop.ch8", &[0x12, 0x00]);

    let output = Command::new(env!("CARGO_BIN_EXE_labwired"))
        .arg(&rom)
        .args(["--system", "chip8", "--max-ticks", "50"])
        .output()
        .expect("failed to run labwired");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let _ = std::fs::remove_file(&rom);
}

#[test]
fn runs_a_gameboy_rom_for_the_requested_tick_count() {
    let rom = write_temp_file("blank.gb", &[0u8; 0x8000]);

    let output = Command::new(env!("CARGO_BIN_EXE_labwired"))
        .arg(&rom)
        .args(["--system", "gameboy", "--max-ticks", "50"])
        .output()
        .expect("failed to run labwired");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let _ = std::fs::remove_file(&rom);
}

#[test]
fn missing_rom_path_exits_non_zero_with_a_diagnostic_not_a_panic() {
    let output = Command::new(env!("CARGO_BIN_EXE_labwired"))
        .arg("/nonexistent/path/to/a.rom")
        .args(["--system", "chip8"])
        .output()
        .expect("failed to run labwired");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("panicked"), "expected a diagnostic, not a panic: {stderr}");
}

#[test]
fn missing_system_kind_exits_non_zero() {
    let rom = write_temp_file("no-system.ch8", &[0x12, 0x00]);

    let output = Command::new(env!("CARGO_BIN_EXE_labwired"))
        .arg(&rom)
        .output()
        .expect("failed to run labwired");

    assert!(!output.status.success());
    let _ = std::fs::remove_file(&rom);
}

#[test]
fn session_file_values_are_used_when_no_matching_flag_is_passed() {
    let rom = write_temp_file("session.ch8", &[0x12, 0x00]);
    let session = write_temp_file(
        "session.yaml",
        format!("system: chip8\nrom_path: {:?}\nscale: 3\n", rom).as_bytes(),
    );

    let output = Command::new(env!("CARGO_BIN_EXE_labwired"))
        .arg(&rom)
        .args(["--session", session.to_str().unwrap(), "--max-ticks", "10"])
        .output()
        .expect("failed to run labwired");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let _ = std::fs::remove_file(&rom);
    let _ = std::fs::remove_file(&session);
}
