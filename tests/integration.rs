use std::{
	ffi::OsString,
	os::unix::ffi::OsStringExt,
	process::{Child, Command},
	thread::sleep,
	time::{Duration, Instant},
};

use assert_cmd::cargo::CommandCargoExt;
use cfg_if::cfg_if;
use nix::{fcntl::OFlag, sys::stat::Mode};
use rstest::{fixture, rstest};
use tempfile::{tempdir, NamedTempFile, TempDir};

#[derive(Clone, Copy, Debug)]
pub struct WaitForError;

impl std::fmt::Display for WaitForError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "timeout waiting for condition")
	}
}

impl std::error::Error for WaitForError {}

pub fn waitfor<C>(timeout: Duration, condition: C) -> Result<(), WaitForError>
where
	C: Fn() -> bool,
{
	let start = Instant::now();
	loop {
		if condition() {
			break Ok(());
		}
		if start.elapsed() > timeout {
			break Err(WaitForError);
		}
		sleep(Duration::from_millis(50));
	}
}

/// Builds a small throwaway image via the `mkfs-lsfs` binary rather than
/// shipping a golden image, since this crate has no pre-existing one.
fn fresh_image() -> NamedTempFile {
	let img = NamedTempFile::new().unwrap();
	let status = Command::cargo_bin("mkfs-lsfs")
		.unwrap()
		.arg(img.path())
		.arg("--size")
		.arg("16")
		.status()
		.unwrap();
	assert!(status.success());
	img
}

struct Harness {
	_img:  NamedTempFile,
	d:     TempDir,
	child: Child,
}

#[fixture]
fn harness() -> Harness {
	let img = fresh_image();
	let d = tempdir().unwrap();
	let child = Command::cargo_bin("fuse-lsfs")
		.unwrap()
		.arg("--foreground")
		.arg(img.path())
		.arg(d.path())
		.spawn()
		.unwrap();

	waitfor(Duration::from_secs(5), || {
		let s = nix::sys::statfs::statfs(d.path()).unwrap();
		cfg_if! {
			if #[cfg(target_os = "linux")] {
				s.filesystem_type() == nix::sys::statfs::FUSE_SUPER_MAGIC
			} else {
				false
			}
		}
	})
	.unwrap();

	Harness { _img: img, d, child }
}

impl Drop for Harness {
	fn drop(&mut self) {
		loop {
			let cmd = Command::new("umount").arg(self.d.path()).output();
			match cmd {
				Err(e) => {
					eprintln!("Executing umount failed: {}", e);
					if std::thread::panicking() {
						return;
					}
					panic!("Executing umount failed");
				}
				Ok(output) => {
					let errmsg = OsString::from_vec(output.stderr).into_string().unwrap();
					if output.status.success() {
						break;
					} else if errmsg.contains("not a file system root directory") {
						break;
					} else if errmsg.contains("Device busy") {
						println!("{}", errmsg);
					} else {
						if std::thread::panicking() {
							println!("{}", errmsg);
							return;
						}
						panic!("{}", errmsg);
					}
				}
			}
			sleep(Duration::from_millis(50));
		}
		let _ = self.child.wait();
	}
}

/// Mount and unmount a freshly formatted image.
#[rstest]
#[cfg(target_os = "linux")]
fn mount(harness: Harness) {
	let d = &harness.d;
	let mut dir = nix::dir::Dir::open(d.path(), OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty()).unwrap();
	let mut entries = dir
		.iter()
		.map(|x| x.unwrap())
		.map(|e| String::from_utf8(e.file_name().to_bytes().to_vec()).unwrap())
		.collect::<Vec<_>>();
	entries.sort();
	assert_eq!(entries, vec![".".to_string(), "..".to_string()]);
	drop(harness);
}

/// Create, write, read back, and list a file through the mounted filesystem.
#[rstest]
#[cfg(target_os = "linux")]
fn create_write_read(harness: Harness) {
	let d = &harness.d;
	let path = d.path().join("hello.txt");
	std::fs::write(&path, b"hello lsfs\n").unwrap();

	let contents = std::fs::read_to_string(&path).unwrap();
	assert_eq!(contents, "hello lsfs\n");

	let names: Vec<String> = std::fs::read_dir(d.path())
		.unwrap()
		.map(|e| e.unwrap().file_name().into_string().unwrap())
		.collect();
	assert!(names.contains(&"hello.txt".to_string()));
}

/// Directories, rename (including cross-directory), and unlink round-trip.
#[rstest]
#[cfg(target_os = "linux")]
fn mkdir_rename_unlink(harness: Harness) {
	let d = &harness.d;
	let sub_a = d.path().join("a");
	let sub_b = d.path().join("b");
	std::fs::create_dir(&sub_a).unwrap();
	std::fs::create_dir(&sub_b).unwrap();

	let file_a = sub_a.join("note.txt");
	std::fs::write(&file_a, b"moved\n").unwrap();

	let file_b = sub_b.join("note.txt");
	std::fs::rename(&file_a, &file_b).unwrap();
	assert_eq!(std::fs::read_to_string(&file_b).unwrap(), "moved\n");
	assert!(!file_a.exists());

	std::fs::remove_file(&file_b).unwrap();
	std::fs::remove_dir(&sub_a).unwrap();
	std::fs::remove_dir(&sub_b).unwrap();
}
