use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::message::read_u32;
use crate::sync::lock;
use crate::{Error, Result};

const KV_MAGIC: [u8; 4] = *b"PKV1";
const KV_EXTENSION: &str = "kv";

type Namespace = BTreeMap<String, Vec<u8>>;

/// Small sorted map for checkpoints and snapshots, partitioned by namespace.
pub trait KvStore: Send + Sync {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, namespace: &str, key: &str) -> Result<()>;
    /// All entries of a namespace in key order.
    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

#[derive(Default)]
pub struct MemoryKvStore {
    namespaces: Mutex<BTreeMap<String, Namespace>>,
    failing_puts: AtomicU32,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` puts fail with `Error::Unavailable`.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::Release);
    }
}

impl KvStore for MemoryKvStore {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let failing = self
            .failing_puts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Unavailable(format!("put {namespace}/{key} rejected")));
        }
        lock(&self.namespaces)
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.namespaces)
            .get(namespace)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        if let Some(entries) = lock(&self.namespaces).get_mut(namespace) {
            entries.remove(key);
        }
        Ok(())
    }

    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(lock(&self.namespaces)
            .get(namespace)
            .map(|entries| entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// Key-value store backed by one checksummed file per key.
///
/// Entries live at `{root}/{namespace}/{hex(key)}.kv` and are cached in
/// memory. A put rewrites only its own file through a temp file, `fsync` and
/// rename, so a crash leaves either the old or the new value on disk.
pub struct FileKvStore {
    root: PathBuf,
    namespaces: Mutex<BTreeMap<String, Namespace>>,
}

impl FileKvStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut namespaces = BTreeMap::new();
        for dir in fs::read_dir(&root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = dir.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_namespace(&name).is_err() {
                continue;
            }
            namespaces.insert(name, load_namespace(&dir.path())?);
        }
        log::debug!(
            "opened kv store at {} with {} namespaces",
            root.display(),
            namespaces.len()
        );

        Ok(Self {
            root,
            namespaces: Mutex::new(namespaces),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, namespace: &str, key: &str) -> PathBuf {
        let name: String = key.bytes().map(|b| format!("{b:02x}")).collect();
        self.root
            .join(namespace)
            .join(format!("{name}.{KV_EXTENSION}"))
    }
}

impl KvStore for FileKvStore {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        validate_namespace(namespace)?;
        let data = encode_entry(key, value)?;
        let mut namespaces = lock(&self.namespaces);
        let dir = self.root.join(namespace);
        if !namespaces.contains_key(namespace) {
            fs::create_dir_all(&dir)?;
            sync_dir(&self.root)?;
        }

        let path = self.entry_path(namespace, key);
        let tmp = path.with_extension("kv.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        sync_dir(&dir)?;

        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.namespaces)
            .get(namespace)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut namespaces = lock(&self.namespaces);
        let Some(entries) = namespaces.get_mut(namespace) else {
            return Ok(());
        };
        if !entries.contains_key(key) {
            return Ok(());
        }
        fs::remove_file(self.entry_path(namespace, key))?;
        sync_dir(&self.root.join(namespace))?;
        entries.remove(key);
        Ok(())
    }

    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(lock(&self.namespaces)
            .get(namespace)
            .map(|entries| entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument("namespace must be [A-Za-z0-9_-]+"))
    }
}

fn load_namespace(dir: &Path) -> Result<Namespace> {
    let mut entries = Namespace::new();
    for file in fs::read_dir(dir)? {
        let path = file?.path();
        // Leftover temp files from an interrupted put end in `.tmp`.
        if path.extension().and_then(|ext| ext.to_str()) != Some(KV_EXTENSION) {
            continue;
        }
        let (key, value) = decode_entry(&fs::read(&path)?)
            .map_err(|err| Error::Corrupt(format!("{}: {err}", path.display())))?;
        entries.insert(key, value);
    }
    Ok(entries)
}

// Layout: magic, key len u32, key, value len u32, value, then crc32 of
// everything before it.
fn encode_entry(key: &str, value: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(KV_MAGIC.len() + 12 + key.len() + value.len());
    buf.extend_from_slice(&KV_MAGIC);
    for field in [key.as_bytes(), value] {
        let len = u32::try_from(field.len())
            .map_err(|_| Error::InvalidArgument("kv entry exceeds 4GiB"))?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(field);
    }
    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

fn decode_entry(data: &[u8]) -> std::result::Result<(String, Vec<u8>), &'static str> {
    if data.len() < KV_MAGIC.len() + 8 + 4 {
        return Err("kv file truncated");
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    if crc32fast::hash(body) != read_u32(trailer, 0) {
        return Err("kv file checksum mismatch");
    }
    if body[..4] != KV_MAGIC {
        return Err("kv file magic mismatch");
    }
    let mut pos = KV_MAGIC.len();
    let key = std::str::from_utf8(take_field(body, &mut pos)?)
        .map_err(|_| "kv key is not utf-8")?
        .to_string();
    let value = take_field(body, &mut pos)?.to_vec();
    if pos != body.len() {
        return Err("kv file has trailing bytes");
    }
    Ok((key, value))
}

fn take_field<'a>(body: &'a [u8], pos: &mut usize) -> std::result::Result<&'a [u8], &'static str> {
    let len_end = *pos + 4;
    if len_end > body.len() {
        return Err("kv entry truncated");
    }
    let len = read_u32(body, *pos) as usize;
    let field = body.get(len_end..len_end + len).ok_or("kv entry truncated")?;
    *pos = len_end + len;
    Ok(field)
}

fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_kv_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = FileKvStore::open(dir.path()).unwrap();
            kv.put("snapshot", "1:0", b"alpha").unwrap();
            kv.put("snapshot", "1:1", b"bravo").unwrap();
            kv.put("checkpoint", "x", b"").unwrap();
            kv.delete("snapshot", "1:1").unwrap();
        }

        let kv = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(kv.get("snapshot", "1:0").unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(kv.get("snapshot", "1:1").unwrap(), None);
        assert_eq!(kv.get("checkpoint", "x").unwrap(), Some(Vec::new()));
        assert_eq!(kv.scan("snapshot").unwrap().len(), 1);
    }

    #[test]
    fn test_file_kv_rejects_damaged_file() {
        let dir = TempDir::new().unwrap();
        {
            let kv = FileKvStore::open(dir.path()).unwrap();
            kv.put("snapshot", "1:0", b"alpha").unwrap();
        }
        let path = dir.path().join("snapshot").join("313a30.kv");
        let mut data = fs::read(&path).unwrap();
        data[10] ^= 0x01;
        fs::write(&path, data).unwrap();

        assert!(matches!(FileKvStore::open(dir.path()), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_file_kv_put_rewrites_only_its_key() {
        let dir = TempDir::new().unwrap();
        let kv = FileKvStore::open(dir.path()).unwrap();
        kv.put("snapshot", "a", b"1").unwrap();
        kv.put("snapshot", "b", b"2").unwrap();
        let other = dir.path().join("snapshot").join("61.kv");
        let before = fs::metadata(&other).unwrap().modified().unwrap();
        let untouched = fs::read(&other).unwrap();

        kv.put("snapshot", "b", b"22").unwrap();
        assert_eq!(fs::read(&other).unwrap(), untouched);
        assert_eq!(fs::metadata(&other).unwrap().modified().unwrap(), before);
        assert_eq!(fs::read_dir(dir.path().join("snapshot")).unwrap().count(), 2);

        // A temp file left by a torn put is ignored on open.
        fs::write(dir.path().join("snapshot").join("63.kv.tmp"), b"junk").unwrap();
        let kv = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(kv.get("snapshot", "b").unwrap(), Some(b"22".to_vec()));
        assert_eq!(kv.scan("snapshot").unwrap().len(), 2);
    }

    #[test]
    fn test_file_kv_rejects_path_like_namespace() {
        let dir = TempDir::new().unwrap();
        let kv = FileKvStore::open(dir.path()).unwrap();
        assert!(matches!(
            kv.put("../escape", "k", b"v"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_memory_kv_scan_is_sorted() {
        let kv = MemoryKvStore::new();
        kv.put("ns", "b", b"2").unwrap();
        kv.put("ns", "a", b"1").unwrap();
        let keys: Vec<_> = kv.scan("ns").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        kv.fail_next_puts(1);
        assert!(kv.put("ns", "c", b"3").is_err());
        kv.put("ns", "c", b"3").unwrap();
    }
}
