// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implements scoped patching of a shared linker script
//!
//! Every application is linked against the same `linker.ld`, which names its
//! load address as a literal hex token (`BASE_ADDRESS = 0x80400000;`). To link
//! an application somewhere else, we rewrite that token in place, run the
//! build, and move on to the next application.
//!
//! The script lives in version control, so it must come back out of this
//! process exactly as it went in. [`LayoutScript`] snapshots the file when it
//! is opened and puts the snapshot back when it is dropped, whether the run
//! finished, bailed out early with `?`, or panicked. Callers that want to know
//! whether the restore worked should call [`LayoutScript::restore`] instead of
//! relying on the drop.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use link_addr::address_token;

/// Backing store for a linker script.
///
/// This is a file on disk in practice ([`LayoutFile`]); tests substitute
/// something that can be made to fail on demand.
pub trait Storage {
    /// Where the script lives, for error messages.
    fn location(&self) -> &Path;
    fn load(&mut self) -> io::Result<Vec<u8>>;
    fn store(&mut self, contents: &[u8]) -> io::Result<()>;
}

/// A linker script on disk, held under an exclusive lock file.
///
/// The path is resolved once, when the lock is taken, and every write goes to
/// the resolved file. If the script is a symlink, the link stays a link and
/// its target is what gets patched.
///
/// The lock is a sibling of the resolved file named `<script>.lock`, created
/// with `create_new` and removed on drop. A second build driver pointed at the
/// same script, by any path, fails to acquire it instead of racing us.
#[derive(Debug)]
pub struct LayoutFile {
    /// As given, for messages.
    path: PathBuf,
    resolved: PathBuf,
    lock: PathBuf,
}

impl LayoutFile {
    pub fn lock(path: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let path = path.into();
        let resolved =
            fs::canonicalize(&path).map_err(|source| ArtifactError::Read {
                path: path.clone(),
                source,
            })?;
        let mut lock = resolved.clone().into_os_string();
        lock.push(".lock");
        let lock = PathBuf::from(lock);

        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::AlreadyExists {
                    ArtifactError::Locked { lock: lock.clone() }
                } else {
                    ArtifactError::Write {
                        path: lock.clone(),
                        source,
                    }
                }
            })?;
        // The pid is only there for a human wondering who holds the lock.
        let _ = writeln!(f, "{}", std::process::id());

        Ok(LayoutFile {
            path,
            resolved,
            lock,
        })
    }
}

impl Storage for LayoutFile {
    fn location(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> io::Result<Vec<u8>> {
        fs::read(&self.resolved)
    }

    /// Writes via a temporary file in the same directory and renames it over
    /// the script, so a crash mid-write leaves either the old or the new
    /// contents and never a truncated file.
    fn store(&mut self, contents: &[u8]) -> io::Result<()> {
        let dir = match self.resolved.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        let perms = fs::metadata(&self.resolved)?.permissions();
        if perms.readonly() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "linker script is read-only",
            ));
        }

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        fs::set_permissions(tmp.path(), perms)?;
        tmp.persist(&self.resolved).map_err(|e| e.error)?;
        Ok(())
    }
}

impl Drop for LayoutFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock) {
            log::warn!("could not remove {}: {}", self.lock.display(), e);
        }
    }
}

/// Replaces every occurrence of `from` with `to`, one line at a time, so the
/// number and order of lines never changes.
pub fn substitute(text: &str, from: &str, to: &str) -> String {
    text.split_inclusive('\n')
        .map(|line| line.replace(from, to))
        .collect()
}

/// A linker script that has been snapshotted and may be retargeted.
pub struct LayoutScript<S: Storage> {
    storage: S,
    /// Exact bytes read at open; this is what goes back on restore.
    original: Vec<u8>,
    /// `original`, as text.
    text: String,
    /// The base-address token found in `original`.
    token: String,
    /// Address most recently written to storage, if any.
    applied: Option<u64>,
    /// Set once storage may differ from `original`.
    dirty: bool,
}

impl<S: Storage> LayoutScript<S> {
    /// Snapshots the script, which must mention `base` (as produced by
    /// [`address_token`]) at least once.
    pub fn open(mut storage: S, base: u64) -> Result<Self, ArtifactError> {
        let path = storage.location().to_path_buf();
        let original = storage.load().map_err(|source| ArtifactError::Read {
            path: path.clone(),
            source,
        })?;
        let text = String::from_utf8(original.clone())
            .map_err(|_| ArtifactError::NotUtf8 { path: path.clone() })?;

        let token = address_token(base);
        let count = text.matches(token.as_str()).count();
        if count == 0 {
            return Err(ArtifactError::MissingToken { path, token });
        }
        log::debug!(
            "{}: {} occurrence(s) of {}",
            path.display(),
            count,
            token
        );

        Ok(LayoutScript {
            storage,
            original,
            text,
            token,
            applied: None,
            dirty: false,
        })
    }

    pub fn location(&self) -> &Path {
        self.storage.location()
    }

    /// The base-address token being replaced.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The address most recently written, if any.
    pub fn applied(&self) -> Option<u64> {
        self.applied
    }

    /// Returns `true` if storage may no longer match the snapshot.
    pub fn is_modified(&self) -> bool {
        self.dirty
    }

    /// Renders the script as it reads when linked at `addr`.
    pub fn render(&self, addr: u64) -> String {
        // Every rendering starts from the snapshot. Only the base token is
        // ever replaced, so an address that the script happens to mention
        // elsewhere is left alone.
        substitute(&self.text, &self.token, &address_token(addr))
    }

    /// Rewrites storage so that the script links at `addr`.
    pub fn retarget(&mut self, addr: u64) -> Result<(), ArtifactError> {
        let rendered = self.render(addr);
        // A failed store may have left anything behind, so mark the storage
        // dirty before we try.
        self.dirty = true;
        self.storage.store(rendered.as_bytes()).map_err(|source| {
            ArtifactError::Write {
                path: self.storage.location().to_path_buf(),
                source,
            }
        })?;
        self.applied = Some(addr);
        Ok(())
    }

    /// Puts the snapshot back and reports whether that worked.
    ///
    /// Restoration is attempted exactly once: if it fails here, dropping the
    /// script won't try again.
    pub fn restore(mut self) -> Result<(), ArtifactError> {
        self.put_back()
    }

    fn put_back(&mut self) -> Result<(), ArtifactError> {
        if !self.dirty {
            return Ok(());
        }
        self.dirty = false;
        self.applied = None;
        self.storage.store(&self.original).map_err(|source| {
            ArtifactError::Write {
                path: self.storage.location().to_path_buf(),
                source,
            }
        })
    }
}

impl<S: Storage> Drop for LayoutScript<S> {
    fn drop(&mut self) {
        if self.dirty {
            log::warn!(
                "restoring {} on drop",
                self.storage.location().display()
            );
        }
        if let Err(e) = self.put_back() {
            log::error!(
                "{} IS LEFT MODIFIED and must be restored by hand: {}",
                self.storage.location().display(),
                e
            );
        }
    }
}

#[derive(Debug)]
pub enum ArtifactError {
    /// Someone else holds the lock file.
    Locked { lock: PathBuf },
    Read { path: PathBuf, source: io::Error },
    NotUtf8 { path: PathBuf },
    MissingToken { path: PathBuf, token: String },
    Write { path: PathBuf, source: io::Error },
}

impl std::fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactError::Locked { lock } => write!(
                f,
                "{} exists; is another build running? \
                 (remove it if not)",
                lock.display()
            ),
            ArtifactError::Read { path, source } => {
                write!(f, "could not read {}: {}", path.display(), source)
            }
            ArtifactError::NotUtf8 { path } => {
                write!(f, "{} is not valid UTF-8", path.display())
            }
            ArtifactError::MissingToken { path, token } => write!(
                f,
                "{} never mentions the base address {}",
                path.display(),
                token
            ),
            ArtifactError::Write { path, source } => {
                write!(f, "could not write {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ArtifactError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArtifactError::Read { source, .. }
            | ArtifactError::Write { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::cell::RefCell;
    use std::rc::Rc;

    const SCRIPT: &str = indoc! {"
        OUTPUT_ARCH(riscv)
        ENTRY(_start)

        BASE_ADDRESS = 0x80400000;

        SECTIONS
        {
            . = BASE_ADDRESS;
            .text : {
                *(.text.entry)
            }
            /* the kernel lives at 0x80200000, below 0x80400000 */
        }
    "};

    /// In-memory storage whose writes can be made to fail.
    #[derive(Clone, Default)]
    struct Mem {
        path: PathBuf,
        contents: Rc<RefCell<Vec<u8>>>,
        read_only: Rc<RefCell<bool>>,
        stores: Rc<RefCell<usize>>,
    }

    impl Mem {
        fn new(text: &str) -> Self {
            Mem {
                path: PathBuf::from("linker.ld"),
                contents: Rc::new(RefCell::new(text.as_bytes().to_vec())),
                ..Default::default()
            }
        }

        fn text(&self) -> String {
            String::from_utf8(self.contents.borrow().clone()).unwrap()
        }
    }

    impl Storage for Mem {
        fn location(&self) -> &Path {
            &self.path
        }
        fn load(&mut self) -> io::Result<Vec<u8>> {
            Ok(self.contents.borrow().clone())
        }
        fn store(&mut self, contents: &[u8]) -> io::Result<()> {
            if *self.read_only.borrow() {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "read-only",
                ));
            }
            *self.stores.borrow_mut() += 1;
            *self.contents.borrow_mut() = contents.to_vec();
            Ok(())
        }
    }

    #[test]
    fn substitution_preserves_lines() {
        let out = substitute(SCRIPT, "0x80400000", "0x80600000");
        assert_eq!(out.lines().count(), SCRIPT.lines().count());
        assert!(!out.contains("0x80400000"));
        assert_eq!(out.matches("0x80600000").count(), 2);
        assert!(out.contains("0x80200000"));
        assert!(out.ends_with("}\n"));
    }

    #[test]
    fn substitution_without_trailing_newline() {
        assert_eq!(
            substitute("a = 0x1;\nb = 0x1;", "0x1", "0x2"),
            "a = 0x2;\nb = 0x2;"
        );
        assert_eq!(substitute("", "0x1", "0x2"), "");
    }

    #[test]
    fn retarget_then_restore() {
        let mem = Mem::new(SCRIPT);
        let mut script = LayoutScript::open(mem.clone(), 0x8040_0000).unwrap();
        assert!(!script.is_modified());

        script.retarget(0x8060_0000).unwrap();
        assert!(mem.text().contains("BASE_ADDRESS = 0x80600000;"));
        assert_eq!(script.applied(), Some(0x8060_0000));

        // Each rewrite starts from the snapshot.
        script.retarget(0x8080_0000).unwrap();
        assert!(mem.text().contains("BASE_ADDRESS = 0x80800000;"));
        assert!(!mem.text().contains("0x80600000"));

        script.restore().unwrap();
        assert_eq!(mem.text(), SCRIPT);
        assert_eq!(*mem.stores.borrow(), 3);
    }

    #[test]
    fn other_addresses_are_left_alone() {
        // The script already mentions the address the second app will get.
        let text = "BASE = 0x80400000;\nNEXT = 0x80600000;\n";
        let mem = Mem::new(text);
        let mut script = LayoutScript::open(mem.clone(), 0x8040_0000).unwrap();
        script.retarget(0x8060_0000).unwrap();
        script.retarget(0x8080_0000).unwrap();
        assert_eq!(mem.text(), "BASE = 0x80800000;\nNEXT = 0x80600000;\n");
    }

    #[test]
    fn drop_restores() {
        let mem = Mem::new(SCRIPT);
        {
            let mut script =
                LayoutScript::open(mem.clone(), 0x8040_0000).unwrap();
            script.retarget(0x8060_0000).unwrap();
        }
        assert_eq!(mem.text(), SCRIPT);
    }

    #[test]
    fn drop_restores_on_panic() {
        let mem = Mem::new(SCRIPT);
        let inner = mem.clone();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut script = LayoutScript::open(inner, 0x8040_0000).unwrap();
            script.retarget(0x8060_0000).unwrap();
            panic!("toolchain exploded");
        }));
        assert!(r.is_err());
        assert_eq!(mem.text(), SCRIPT);
    }

    #[test]
    fn untouched_script_is_not_rewritten() {
        let mem = Mem::new(SCRIPT);
        let script = LayoutScript::open(mem.clone(), 0x8040_0000).unwrap();
        script.restore().unwrap();
        assert_eq!(*mem.stores.borrow(), 0);
    }

    #[test]
    fn failed_restore_is_reported_once() {
        let mem = Mem::new(SCRIPT);
        let mut script = LayoutScript::open(mem.clone(), 0x8040_0000).unwrap();
        script.retarget(0x8060_0000).unwrap();
        *mem.read_only.borrow_mut() = true;

        let err = script.restore().unwrap_err();
        assert!(matches!(err, ArtifactError::Write { .. }));
        assert!(mem.text().contains("0x80600000"));
        assert_eq!(*mem.stores.borrow(), 1);
    }

    #[test]
    fn failed_write_still_counts_as_modified() {
        let mem = Mem::new(SCRIPT);
        *mem.read_only.borrow_mut() = true;
        let mut script = LayoutScript::open(mem.clone(), 0x8040_0000).unwrap();
        assert!(script.retarget(0x8060_0000).is_err());
        assert!(script.is_modified());
        assert_eq!(script.applied(), None);
    }

    #[test]
    fn missing_token() {
        let err = LayoutScript::open(Mem::new(SCRIPT), 0x9000_0000)
            .err()
            .unwrap();
        match err {
            ArtifactError::MissingToken { token, .. } => {
                assert_eq!(token, "0x90000000")
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn not_utf8() {
        let mem = Mem::new("");
        *mem.contents.borrow_mut() = vec![0xff, 0xfe, b'0', b'x'];
        let err = LayoutScript::open(mem, 0x8040_0000).err().unwrap();
        assert!(matches!(err, ArtifactError::NotUtf8 { .. }));
    }

    #[test]
    fn file_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linker.ld");
        // CRLF line endings and no trailing newline must survive.
        let text = "BASE_ADDRESS = 0x80400000;\r\n. = BASE_ADDRESS;";
        fs::write(&path, text).unwrap();

        {
            let file = LayoutFile::lock(&path).unwrap();
            let mut script = LayoutScript::open(file, 0x8040_0000).unwrap();
            script.retarget(0x8060_0000).unwrap();
            assert_eq!(
                fs::read_to_string(&path).unwrap(),
                "BASE_ADDRESS = 0x80600000;\r\n. = BASE_ADDRESS;"
            );
            script.restore().unwrap();
        }
        assert_eq!(fs::read(&path).unwrap(), text.as_bytes());
        assert!(!dir.path().join("linker.ld.lock").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_script_stays_a_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.ld");
        let link = dir.path().join("linker.ld");
        fs::write(&shared, SCRIPT).unwrap();
        std::os::unix::fs::symlink("shared.ld", &link).unwrap();

        {
            let file = LayoutFile::lock(&link).unwrap();
            let mut script = LayoutScript::open(file, 0x8040_0000).unwrap();
            assert_eq!(script.location(), link.as_path());
            script.retarget(0x8060_0000).unwrap();

            // A build reading through the link sees the new address.
            let seen = fs::read_to_string(&link).unwrap();
            assert!(seen.contains("BASE_ADDRESS = 0x80600000;"));
            assert!(fs::symlink_metadata(&link).unwrap().is_symlink());
            script.restore().unwrap();
        }

        assert!(fs::symlink_metadata(&link).unwrap().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("shared.ld"));
        assert_eq!(fs::read_to_string(&shared).unwrap(), SCRIPT);
        assert!(!dir.path().join("shared.ld.lock").exists());
    }

    #[cfg(unix)]
    #[test]
    fn lock_is_shared_across_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.ld");
        fs::write(&shared, SCRIPT).unwrap();
        let link = dir.path().join("linker.ld");
        std::os::unix::fs::symlink(&shared, &link).unwrap();

        let _held = LayoutFile::lock(&shared).unwrap();
        let err = LayoutFile::lock(&link).unwrap_err();
        assert!(matches!(err, ArtifactError::Locked { .. }));
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linker.ld");
        fs::write(&path, SCRIPT).unwrap();

        let held = LayoutFile::lock(&path).unwrap();
        let err = LayoutFile::lock(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::Locked { .. }));
        drop(held);
        LayoutFile::lock(&path).unwrap();
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.ld");
        match LayoutFile::lock(&path).unwrap_err() {
            ArtifactError::Read { path: p, .. } => assert_eq!(p, path),
            e => panic!("unexpected error {e}"),
        }
        assert!(!dir.path().join("nope.ld.lock").exists());
    }

    #[test]
    fn missing_directory_names_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src").join("linker.ld");
        match LayoutFile::lock(&path).unwrap_err() {
            ArtifactError::Read { path: p, .. } => assert_eq!(p, path),
            e => panic!("unexpected error {e}"),
        }
    }
}
