//! DSO bookkeeping and filesystem build-id lookup.
//!
//! Every distinct mapping filename gets one [`DsoInfo`] record for the
//! lifetime of the pipeline. Samples that resolve into a DSO mark it hit and
//! record the observing thread; the hit bit and thread set later drive the
//! optional build-id search, which reads the DSO straight from the
//! filesystem (possibly through `/proc/<pid>/root` for containerized
//! processes).

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use object::Object;
use tracing::debug;

use crate::event::MmapEvent;
use crate::utils::{pid_from_packed, tid_from_packed};

/// Everything known about one mapping filename.
#[derive(Debug, Clone, Default)]
pub struct DsoInfo {
    pub name: String,
    pub maj: u32,
    pub min: u32,
    pub ino: u64,
    pub ino_generation: u64,
    /// Lowercase hex, empty when unknown.
    pub build_id: String,
    /// True once any sample resolved into this DSO.
    pub hit: bool,
    /// Packed (pid, tid) values of threads observed sampling this DSO.
    pub threads: BTreeSet<u64>,
}

/// Owns the [`DsoInfo`] records, keyed by filename. Records are addressed by
/// index so resolved samples can carry a plain `usize` instead of a
/// reference into the registry.
#[derive(Debug, Default)]
pub struct DsoRegistry {
    dsos: Vec<DsoInfo>,
    by_name: HashMap<String, usize>,
}

impl DsoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a DSO observation from an MMAP event, returning its index.
    /// The first observation wins: device identity from a later MMAP2 of an
    /// already-known filename is not merged in.
    pub fn observe(&mut self, mmap: &MmapEvent, has_device_info: bool) -> usize {
        if let Some(&index) = self.by_name.get(&mmap.filename) {
            return index;
        }
        let mut dso = DsoInfo {
            name: mmap.filename.clone(),
            ..Default::default()
        };
        if has_device_info {
            dso.maj = mmap.maj;
            dso.min = mmap.min;
            dso.ino = mmap.ino;
            dso.ino_generation = mmap.ino_generation;
        }
        if let Some(build_id) = &mmap.build_id {
            dso.build_id = hex::encode(build_id);
        }
        let index = self.dsos.len();
        self.by_name.insert(mmap.filename.clone(), index);
        self.dsos.push(dso);
        index
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, index: usize) -> &DsoInfo {
        &self.dsos[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut DsoInfo {
        &mut self.dsos[index]
    }

    pub fn build_id_for(&self, name: &str) -> Option<&str> {
        self.index_of(name)
            .map(|index| self.dsos[index].build_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn len(&self) -> usize {
        self.dsos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dsos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DsoInfo> {
        self.dsos.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DsoInfo> {
        self.dsos.iter_mut()
    }
}

/// Pseudo-filenames for the kernel image itself. Its build id cannot be read
/// from the filesystem the way modules and regular DSOs can.
pub fn is_kernel_non_module_name(name: &str) -> bool {
    name.starts_with("[kernel.kallsyms]")
        || name == "[vdso]"
        || name == "[vsyscall]"
        || name == "[vectors]"
}

fn is_module_name(name: &str) -> bool {
    name.len() >= 2 && name.starts_with('[') && name.ends_with(']')
}

/// Extracts the descriptor of the first NT_GNU_BUILD_ID entry from a raw ELF
/// note stream (the format of `/sys/module/<name>/notes/*`).
fn parse_build_id_note(data: &[u8]) -> Option<Vec<u8>> {
    const NT_GNU_BUILD_ID: u32 = 3;
    let align4 = |n: usize| (n + 3) & !3;

    let mut rest = data;
    while rest.len() >= 12 {
        let namesz = u32::from_ne_bytes(rest[0..4].try_into().ok()?) as usize;
        let descsz = u32::from_ne_bytes(rest[4..8].try_into().ok()?) as usize;
        let kind = u32::from_ne_bytes(rest[8..12].try_into().ok()?);
        let name_end = 12usize.checked_add(align4(namesz))?;
        let desc_end = name_end.checked_add(align4(descsz))?;
        if desc_end > rest.len() {
            return None;
        }
        let name = &rest[12..12 + namesz];
        if kind == NT_GNU_BUILD_ID && name == b"GNU\0" {
            return Some(rest[name_end..name_end + descsz].to_vec());
        }
        rest = &rest[desc_end..];
    }
    None
}

/// Reads the build id of a loaded kernel module from sysfs.
pub fn read_module_build_id(module_name: &str) -> Option<Vec<u8>> {
    let path = format!("/sys/module/{module_name}/notes/.note.gnu.build-id");
    let data = std::fs::read(&path).ok()?;
    parse_build_id_note(&data)
}

/// Reads the NT_GNU_BUILD_ID note of the ELF file at `path`.
pub fn read_elf_build_id(path: &Path) -> Result<Option<Vec<u8>>> {
    let mut file =
        File::open(path).with_context(|| format!("opening ELF file {}", path.display()))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .with_context(|| format!("reading ELF file {}", path.display()))?;
    let elf = object::File::parse(&*data)
        .with_context(|| format!("parsing ELF file {}", path.display()))?;
    Ok(elf.build_id()?.map(|id| id.to_vec()))
}

/// Opens `path` and reads its build id, but only if the file on disk is the
/// same inode the mapping was recorded against. The inode check is skipped
/// when the DSO has no device info (plain MMAP rather than MMAP2).
pub fn read_elf_build_id_if_same_inode(path: &Path, dso: &DsoInfo) -> Option<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!("failed to open ELF file {}: {err}", path.display());
            }
            return None;
        }
    };

    if dso.maj != 0 && dso.min != 0 {
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                debug!("failed to stat {}: {err}", path.display());
                return None;
            }
        };
        if meta.ino() != dso.ino {
            return None;
        }
    }

    let mut data = Vec::new();
    if let Err(err) = file.read_to_end(&mut data) {
        debug!("failed to read {}: {err}", path.display());
        return None;
    }
    match object::File::parse(&*data) {
        Ok(elf) => elf.build_id().ok().flatten().map(|id| id.to_vec()),
        Err(err) => {
            debug!("failed to parse {}: {err}", path.display());
            None
        }
    }
}

/// Candidate paths for a regular DSO, in search order: the root of every
/// observing thread, the root of each thread's parent process when distinct,
/// and finally the name as a host-relative path.
pub fn build_id_search_paths(dso: &DsoInfo) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut last_pid = 0u32;
    for &packed in &dso.threads {
        let pid = pid_from_packed(packed);
        let tid = tid_from_packed(packed);
        paths.push(PathBuf::from(format!("/proc/{tid}/root/{}", dso.name)));
        // Threads of a process are adjacent in the sorted set, so one parent
        // lookup per process is enough; the main thread is its own parent.
        if pid == last_pid || pid == tid {
            continue;
        }
        last_pid = pid;
        paths.push(PathBuf::from(format!("/proc/{pid}/root/{}", dso.name)));
    }
    paths.push(PathBuf::from(&dso.name));
    paths
}

/// Looks up the build id of a DSO by reading directly from the filesystem.
/// The main kernel binary is not supported; kernel modules are read from
/// sysfs; everything else goes through the path search.
pub fn find_dso_build_id(dso: &DsoInfo) -> Option<Vec<u8>> {
    if is_kernel_non_module_name(&dso.name) {
        return None;
    }
    if is_module_name(&dso.name) {
        return read_module_build_id(&dso.name[1..dso.name.len() - 1]);
    }
    build_id_search_paths(dso)
        .iter()
        .find_map(|path| read_elf_build_id_if_same_inode(path, dso))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::pack_pid_tid;
    use std::io::Write;

    fn mmap_for(filename: &str) -> MmapEvent {
        MmapEvent {
            filename: filename.to_string(),
            maj: 8,
            min: 1,
            ino: 42,
            ..Default::default()
        }
    }

    #[test]
    fn test_registry_first_observation_wins() {
        let mut registry = DsoRegistry::new();
        let first = registry.observe(&mmap_for("/usr/lib/libc.so.6"), false);
        let second = registry.observe(&mmap_for("/usr/lib/libc.so.6"), true);
        assert_eq!(first, second);
        // Device info from the later MMAP2 is not merged in.
        assert_eq!(registry.get(first).ino, 0);
    }

    #[test]
    fn test_registry_device_info_from_mmap2() {
        let mut registry = DsoRegistry::new();
        let index = registry.observe(&mmap_for("/bin/true"), true);
        let dso = registry.get(index);
        assert_eq!((dso.maj, dso.min, dso.ino), (8, 1, 42));
    }

    #[test]
    fn test_kernel_names() {
        assert!(is_kernel_non_module_name("[kernel.kallsyms]"));
        assert!(is_kernel_non_module_name("[kernel.kallsyms]_text"));
        assert!(is_kernel_non_module_name("[vdso]"));
        assert!(!is_kernel_non_module_name("[nf_tables]"));
        assert!(!is_kernel_non_module_name("/usr/bin/perf"));
    }

    #[test]
    fn test_module_names() {
        assert!(is_module_name("[nf_tables]"));
        assert!(!is_module_name("[kernel.kallsyms"));
        assert!(!is_module_name("/lib/ld.so"));
    }

    #[test]
    fn test_parse_build_id_note() {
        let mut note = Vec::new();
        note.extend_from_slice(&4u32.to_ne_bytes()); // namesz
        note.extend_from_slice(&8u32.to_ne_bytes()); // descsz
        note.extend_from_slice(&3u32.to_ne_bytes()); // NT_GNU_BUILD_ID
        note.extend_from_slice(b"GNU\0");
        note.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04]);

        assert_eq!(
            parse_build_id_note(&note),
            Some(vec![0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04])
        );
    }

    #[test]
    fn test_parse_build_id_note_skips_other_notes() {
        let mut note = Vec::new();
        // A non-GNU note first.
        note.extend_from_slice(&5u32.to_ne_bytes());
        note.extend_from_slice(&4u32.to_ne_bytes());
        note.extend_from_slice(&1u32.to_ne_bytes());
        note.extend_from_slice(b"Xen\0\0\0\0\0"); // padded to 8
        note.extend_from_slice(&[1, 2, 3, 4]);
        // Then the build id.
        note.extend_from_slice(&4u32.to_ne_bytes());
        note.extend_from_slice(&2u32.to_ne_bytes());
        note.extend_from_slice(&3u32.to_ne_bytes());
        note.extend_from_slice(b"GNU\0");
        note.extend_from_slice(&[0xaa, 0xbb, 0, 0]); // desc padded to 4

        assert_eq!(parse_build_id_note(&note), Some(vec![0xaa, 0xbb]));
    }

    #[test]
    fn test_parse_build_id_note_truncated() {
        let mut note = Vec::new();
        note.extend_from_slice(&4u32.to_ne_bytes());
        note.extend_from_slice(&100u32.to_ne_bytes()); // descsz larger than data
        note.extend_from_slice(&3u32.to_ne_bytes());
        note.extend_from_slice(b"GNU\0");
        assert_eq!(parse_build_id_note(&note), None);
    }

    #[test]
    fn test_search_path_order() {
        let mut dso = DsoInfo {
            name: "/opt/app/libwork.so".to_string(),
            ..Default::default()
        };
        // Process 10 with two threads, process 20 single-threaded.
        dso.threads.insert(pack_pid_tid(10, 10));
        dso.threads.insert(pack_pid_tid(10, 11));
        dso.threads.insert(pack_pid_tid(20, 21));

        let paths = build_id_search_paths(&dso);
        let expected: Vec<PathBuf> = [
            "/proc/10/root//opt/app/libwork.so",
            "/proc/11/root//opt/app/libwork.so",
            "/proc/10/root//opt/app/libwork.so",
            "/proc/21/root//opt/app/libwork.so",
            "/proc/20/root//opt/app/libwork.so",
            "/opt/app/libwork.so",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn test_read_build_id_missing_file_is_silent() {
        let dso = DsoInfo {
            name: "/no/such/file".to_string(),
            ..Default::default()
        };
        assert_eq!(
            read_elf_build_id_if_same_inode(Path::new("/no/such/file"), &dso),
            None
        );
    }

    #[test]
    fn test_read_build_id_rejects_non_elf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an ELF").unwrap();
        let dso = DsoInfo::default();
        assert_eq!(read_elf_build_id_if_same_inode(file.path(), &dso), None);
    }

    #[test]
    fn test_read_build_id_inode_mismatch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"irrelevant").unwrap();
        let dso = DsoInfo {
            maj: 8,
            min: 1,
            ino: u64::MAX, // will not match the temp file's inode
            ..Default::default()
        };
        assert_eq!(read_elf_build_id_if_same_inode(file.path(), &dso), None);
    }
}
