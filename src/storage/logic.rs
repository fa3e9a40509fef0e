// restoretool/src/storage/logic.rs
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

use super::{BucketPreview, BucketReport, FailedUpload, ObjectStore, StorageOptions};
use crate::errors::{RestoreError, Result};

/// Tool and build directories never worth restoring.
const EPHEMERAL_DIRS: &[&str] = &[
    ".next",
    "node_modules",
    ".git",
    ".turbo",
    ".vercel",
    ".cache",
    "dist",
    "build",
    ".expo",
    ".nuxt",
    "coverage",
    ".idea",
    ".vscode",
    ".husky",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalFile {
    key: String,
    path: PathBuf,
}

/// What one bucket needs: the remote paths already present and the local
/// files left to send once those are excluded.
#[derive(Debug)]
struct StorageDiffPlan {
    existing: HashSet<String>,
    local_files: usize,
    to_upload: Vec<LocalFile>,
}

fn bucket_dirs(storage_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut buckets = Vec::new();
    for entry in std::fs::read_dir(storage_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => buckets.push((name, entry.path())),
            Err(raw) => warn!("⚠️  Skipping bucket directory with non UTF-8 name: {:?}", raw),
        }
    }
    buckets.sort();
    Ok(buckets)
}

/// Restores every `storage/<bucket>` directory into its bucket. Buckets run
/// in parallel and fail independently; only an unreadable `storage_dir`
/// fails the whole phase.
pub async fn restore_storage(
    store: Arc<dyn ObjectStore>,
    storage_dir: &Path,
    options: &StorageOptions,
) -> Result<Vec<BucketReport>> {
    let buckets = bucket_dirs(storage_dir)?;
    info!("🔄 Restoring {} storage buckets from {}", buckets.len(), storage_dir.display());

    let mut joins = JoinSet::new();
    for (name, dir) in &buckets {
        let store = Arc::clone(&store);
        let name = name.clone();
        let dir = dir.clone();
        let options = options.clone();
        joins.spawn(async move {
            match restore_bucket(store, &name, &dir, &options).await {
                Ok(report) => report,
                Err(e) => {
                    error!("Bucket {} failed: {}", name, e);
                    BucketReport::failed(name, e.to_string())
                }
            }
        });
    }

    let mut reports = Vec::with_capacity(buckets.len());
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => error!("Bucket task aborted: {}", e),
        }
    }
    // A bucket whose task died still gets a line in the report.
    for (name, _) in &buckets {
        if !reports.iter().any(|r| &r.bucket_name == name) {
            reports.push(BucketReport::failed(name.clone(), "bucket task aborted"));
        }
    }
    reports.sort_by(|a, b| a.bucket_name.cmp(&b.bucket_name));
    Ok(reports)
}

async fn restore_bucket(
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    dir: &Path,
    options: &StorageOptions,
) -> Result<BucketReport> {
    if !store.bucket_exists(bucket).await? {
        info!("Creating private bucket {}", bucket);
        store.create_bucket(bucket).await?;
    }

    let existing = list_remote_paths(store.as_ref(), bucket).await?;
    let plan = plan_bucket(existing, dir, options.overwrite_files)?;
    info!(
        "Bucket {}: {} local files, {} already remote, {} to upload",
        bucket,
        plan.local_files,
        plan.existing.len(),
        plan.to_upload.len()
    );

    let skipped_existing = plan.local_files - plan.to_upload.len();
    let to_upload = plan.to_upload.len();
    let failed_files = upload_all(store, bucket, plan.to_upload, options).await;

    let report = BucketReport {
        bucket_name: bucket.to_string(),
        success: failed_files.is_empty(),
        error: (!failed_files.is_empty())
            .then(|| format!("{} of {} uploads failed", failed_files.len(), to_upload)),
        uploaded: to_upload - failed_files.len(),
        skipped_existing,
        failed_files,
    };
    if report.success {
        info!("✓ Bucket {} restored ({} uploaded)", bucket, report.uploaded);
    } else {
        warn!("⚠️  Bucket {}: {}", bucket, report.error.as_deref().unwrap_or_default());
    }
    Ok(report)
}

/// Every object path in `bucket`. Entries without a size are prefixes and
/// are listed in turn.
async fn list_remote_paths(store: &dyn ObjectStore, bucket: &str) -> Result<HashSet<String>> {
    let mut paths = HashSet::new();
    let mut pending = vec![String::new()];

    while let Some(prefix) = pending.pop() {
        for entry in store.list(bucket, &prefix).await? {
            if entry.name.is_empty() {
                continue;
            }
            let path = if prefix.is_empty() {
                entry.name
            } else {
                format!("{}/{}", prefix, entry.name)
            };
            match entry.size {
                Some(_) => {
                    paths.insert(path);
                }
                None => pending.push(path),
            }
        }
    }
    Ok(paths)
}

fn is_ephemeral(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy().to_lowercase();
    if entry.file_type().is_dir() {
        EPHEMERAL_DIRS.contains(&name.as_str())
    } else {
        is_temp_file(&name) || name.starts_with('~')
    }
}

/// `.tmp` closing the name or followed by another suffix (`x.tmp.1`).
fn is_temp_file(lower_name: &str) -> bool {
    lower_name.ends_with(".tmp") || lower_name.contains(".tmp.")
}

/// Object key for `path` under `root`: `/` separated, no leading or
/// trailing slash.
fn object_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .filter(|part| !part.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn collect_local_files(dir: &Path) -> Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ephemeral(e))
    {
        let entry = entry.map_err(|e| RestoreError::Storage(format!("walking {}: {}", dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(key) = object_key(dir, entry.path()) {
            files.push(LocalFile {
                key,
                path: entry.into_path(),
            });
        }
    }
    Ok(files)
}

fn plan_bucket(existing: HashSet<String>, dir: &Path, overwrite_files: bool) -> Result<StorageDiffPlan> {
    let candidates = collect_local_files(dir)?;
    let local_files = candidates.len();
    let to_upload = candidates
        .into_iter()
        .filter(|file| overwrite_files || !existing.contains(&file.key))
        .collect();
    Ok(StorageDiffPlan {
        existing,
        local_files,
        to_upload,
    })
}

/// Uploads with at most `options.concurrency` in flight. Returns the files
/// that still failed after every attempt.
async fn upload_all(
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    files: Vec<LocalFile>,
    options: &StorageOptions,
) -> Vec<FailedUpload> {
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let upsert = options.upsert();
    let mut joins = JoinSet::new();

    for file in files {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("Upload pool closed: {}", e);
                break;
            }
        };
        let store = Arc::clone(&store);
        let bucket = bucket.to_string();
        let options = options.clone();
        joins.spawn(async move {
            let result = upload_with_retry(store.as_ref(), &bucket, &file, upsert, &options).await;
            drop(permit);
            (file.key, result)
        });
    }

    let mut failed = Vec::new();
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((key, Err(e))) => failed.push(FailedUpload {
                path: key,
                error: e.to_string(),
            }),
            Err(e) => failed.push(FailedUpload {
                path: String::from("<unknown>"),
                error: format!("upload task aborted: {}", e),
            }),
        }
    }
    failed.sort_by(|a, b| a.path.cmp(&b.path));
    failed
}

async fn upload_with_retry(
    store: &dyn ObjectStore,
    bucket: &str,
    file: &LocalFile,
    upsert: bool,
    options: &StorageOptions,
) -> Result<()> {
    let attempts = options.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let outcome = match tokio::fs::read(&file.path).await {
            Ok(body) => store.upload(bucket, &file.key, body, upsert).await,
            Err(e) => Err(RestoreError::Io(e)),
        };
        match outcome {
            Ok(()) => {
                debug!("Uploaded {}/{}", bucket, file.key);
                return Ok(());
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    warn!(
                        "Upload {}/{} failed (attempt {}/{}): {}",
                        bucket, file.key, attempt, attempts, last_error
                    );
                    tokio::time::sleep(options.retry_base_delay * attempt as u32).await;
                }
            }
        }
    }
    Err(RestoreError::Transport(format!(
        "{} after {} attempts: {}",
        file.key, attempts, last_error
    )))
}

/// Dry run of [`restore_storage`]: lists and diffs every bucket, uploads
/// and creates nothing.
pub async fn plan_storage(
    store: Arc<dyn ObjectStore>,
    storage_dir: &Path,
    options: &StorageOptions,
) -> Result<Vec<BucketPreview>> {
    let mut previews = Vec::new();
    for (bucket, dir) in bucket_dirs(storage_dir)? {
        previews.push(preview_bucket(store.as_ref(), &bucket, &dir, options.overwrite_files).await);
    }
    Ok(previews)
}

async fn preview_bucket(
    store: &dyn ObjectStore,
    bucket: &str,
    dir: &Path,
    overwrite_files: bool,
) -> BucketPreview {
    let mut preview = BucketPreview {
        bucket: bucket.to_string(),
        bucket_exists: false,
        local_files: 0,
        existing_remote: 0,
        to_upload: 0,
        error: None,
    };

    let existing = match store.bucket_exists(bucket).await {
        Ok(true) => {
            preview.bucket_exists = true;
            list_remote_paths(store, bucket).await
        }
        Ok(false) => Ok(HashSet::new()),
        Err(e) => Err(e),
    };
    let plan = existing.and_then(|existing| plan_bucket(existing, dir, overwrite_files));
    match plan {
        Ok(plan) => {
            preview.local_files = plan.local_files;
            preview.existing_remote = plan.existing.len();
            preview.to_upload = plan.to_upload.len();
        }
        Err(e) => preview.error = Some(e.to_string()),
    }
    preview
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::storage::ObjectEntry;

    /// Buckets of key -> bytes. Listing honors one level per call like the
    /// S3 delimiter listing does.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
        private_buckets: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, String, bool)>>,
        flaky: Mutex<HashMap<String, usize>>,
        broken_buckets: Mutex<Vec<String>>,
    }

    impl MemoryStore {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn seed(&self, bucket: &str, key: &str) {
            let mut buckets = self.buckets.lock().unwrap();
            buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), b"seed".to_vec());
        }

        /// The next `times` uploads of `key` fail.
        pub(crate) fn fail_uploads(&self, key: &str, times: usize) {
            self.flaky.lock().unwrap().insert(key.to_string(), times);
        }

        pub(crate) fn break_bucket(&self, bucket: &str) {
            self.broken_buckets.lock().unwrap().push(bucket.to_string());
        }

        pub(crate) fn upload_calls(&self) -> Vec<(String, String, bool)> {
            self.uploads.lock().unwrap().clone()
        }

        pub(crate) fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
            self.buckets.lock().unwrap().get(bucket)?.get(key).cloned()
        }

        fn is_broken(&self, bucket: &str) -> bool {
            self.broken_buckets.lock().unwrap().iter().any(|b| b == bucket)
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
            Ok(self.buckets.lock().unwrap().contains_key(bucket))
        }

        async fn create_bucket(&self, bucket: &str) -> Result<()> {
            self.buckets.lock().unwrap().entry(bucket.to_string()).or_default();
            self.private_buckets.lock().unwrap().push(bucket.to_string());
            Ok(())
        }

        async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>> {
            if self.is_broken(bucket) {
                return Err(RestoreError::Storage(format!("listing {} refused", bucket)));
            }
            let buckets = self.buckets.lock().unwrap();
            let Some(objects) = buckets.get(bucket) else {
                return Err(RestoreError::Storage(format!("no such bucket {}", bucket)));
            };
            let scope = if prefix.is_empty() {
                String::new()
            } else {
                format!("{}/", prefix)
            };
            let mut entries: Vec<ObjectEntry> = Vec::new();
            for (key, body) in objects {
                let Some(rest) = key.strip_prefix(&scope) else { continue };
                let entry = match rest.split_once('/') {
                    Some((dir, _)) => ObjectEntry {
                        name: dir.to_string(),
                        size: None,
                    },
                    None => ObjectEntry {
                        name: rest.to_string(),
                        size: Some(body.len() as u64),
                    },
                };
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
            Ok(entries)
        }

        async fn upload(&self, bucket: &str, key: &str, body: Vec<u8>, upsert: bool) -> Result<()> {
            self.uploads
                .lock()
                .unwrap()
                .push((bucket.to_string(), key.to_string(), upsert));
            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(left) = flaky.get_mut(key) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(RestoreError::Transport(format!("connection reset on {}", key)));
                    }
                }
            }
            let mut buckets = self.buckets.lock().unwrap();
            let objects = buckets.entry(bucket.to_string()).or_default();
            if !upsert && objects.contains_key(key) {
                return Err(RestoreError::Transport(format!("{} already exists", key)));
            }
            objects.insert(key.to_string(), body);
            Ok(())
        }
    }

    fn options(overwrite_files: bool) -> StorageOptions {
        StorageOptions {
            incremental: false,
            overwrite_files,
            concurrency: 4,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    fn write_file(root: &Path, relative: &str, body: &str) -> anyhow::Result<()> {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, body)?;
        Ok(())
    }

    fn bucket_with_files(storage: &Path, bucket: &str, count: usize) -> anyhow::Result<()> {
        for i in 0..count {
            write_file(storage, &format!("{}/file-{:02}.txt", bucket, i), "payload")?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_files_are_not_uploaded_again() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        bucket_with_files(temp.path(), "avatars", 50)?;
        let store = MemoryStore::new();
        for i in 0..10 {
            store.seed("avatars", &format!("file-{:02}.txt", i));
        }

        let reports = restore_storage(store.clone(), temp.path(), &options(false)).await?;

        assert_eq!(store.upload_calls().len(), 40);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].success);
        assert_eq!(reports[0].uploaded, 40);
        assert_eq!(reports[0].skipped_existing, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_overwrite_uploads_everything() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        bucket_with_files(temp.path(), "avatars", 50)?;
        let store = MemoryStore::new();
        for i in 0..10 {
            store.seed("avatars", &format!("file-{:02}.txt", i));
        }

        let reports = restore_storage(store.clone(), temp.path(), &options(true)).await?;

        let calls = store.upload_calls();
        assert_eq!(calls.len(), 50);
        assert!(calls.iter().all(|(_, _, upsert)| *upsert));
        assert_eq!(reports[0].uploaded, 50);
        assert_eq!(store.object("avatars", "file-00.txt"), Some(b"payload".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_nested_remote_prefixes_are_listed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        write_file(temp.path(), "docs/2024/01/report.pdf", "a")?;
        write_file(temp.path(), "docs/2024/02/report.pdf", "b")?;
        write_file(temp.path(), "docs/readme.md", "c")?;
        let store = MemoryStore::new();
        store.seed("docs", "2024/01/report.pdf");

        let reports = restore_storage(store.clone(), temp.path(), &options(false)).await?;

        let mut keys: Vec<String> = store.upload_calls().into_iter().map(|(_, k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["2024/02/report.pdf", "readme.md"]);
        assert_eq!(reports[0].skipped_existing, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        bucket_with_files(temp.path(), "media", 3)?;
        let store = MemoryStore::new();
        store.fail_uploads("file-01.txt", 2);

        let reports = restore_storage(store.clone(), temp.path(), &options(false)).await?;

        assert!(reports[0].success);
        assert_eq!(reports[0].uploaded, 3);
        assert_eq!(store.upload_calls().len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_failed_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        bucket_with_files(temp.path(), "media", 3)?;
        let store = MemoryStore::new();
        store.fail_uploads("file-02.txt", 10);

        let reports = restore_storage(store.clone(), temp.path(), &options(false)).await?;

        let report = &reports[0];
        assert!(!report.success);
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed_files.len(), 1);
        assert_eq!(report.failed_files[0].path, "file-02.txt");
        // 2 clean uploads plus 3 attempts on the broken one.
        assert_eq!(store.upload_calls().len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_bucket_is_created_private() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        bucket_with_files(temp.path(), "fresh", 2)?;
        let store = MemoryStore::new();

        let reports = restore_storage(store.clone(), temp.path(), &options(false)).await?;

        assert_eq!(*store.private_buckets.lock().unwrap(), vec!["fresh".to_string()]);
        assert_eq!(reports[0].uploaded, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_bucket_failure_does_not_affect_others() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        bucket_with_files(temp.path(), "alpha", 2)?;
        bucket_with_files(temp.path(), "beta", 2)?;
        let store = MemoryStore::new();
        store.seed("alpha", "old.txt");
        store.break_bucket("alpha");

        let reports = restore_storage(store.clone(), temp.path(), &options(false)).await?;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].bucket_name, "alpha");
        assert!(!reports[0].success);
        assert!(reports[0].error.as_deref().unwrap_or_default().contains("refused"));
        assert!(reports[1].success);
        assert_eq!(reports[1].uploaded, 2);
        let calls = store.upload_calls();
        assert!(calls.iter().all(|(bucket, _, _)| bucket == "beta"));
        Ok(())
    }

    #[tokio::test]
    async fn test_ephemeral_files_are_skipped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        write_file(temp.path(), "site/index.html", "x")?;
        write_file(temp.path(), "site/node_modules/pkg/index.js", "x")?;
        write_file(temp.path(), "site/.git/HEAD", "x")?;
        write_file(temp.path(), "site/upload.tmp", "x")?;
        write_file(temp.path(), "site/~lock.docx", "x")?;
        write_file(temp.path(), "site/assets/app.css", "x")?;
        write_file(temp.path(), "site/Node_Modules/pkg/index.js", "x")?;
        write_file(temp.path(), "site/.Git/config", "x")?;
        write_file(temp.path(), "site/a.TMP", "x")?;
        write_file(temp.path(), "site/b.tmp.1", "x")?;
        write_file(temp.path(), "site/notes.tmpl", "x")?;

        let files = collect_local_files(&temp.path().join("site"))?;
        let keys: Vec<&str> = files.iter().map(|f| f.key.as_str()).collect();

        assert_eq!(keys, vec!["assets/app.css", "index.html", "notes.tmpl"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_incremental_without_overwrite_uses_conditional_put() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        bucket_with_files(temp.path(), "media", 1)?;
        let store = MemoryStore::new();
        let opts = StorageOptions {
            incremental: true,
            ..options(false)
        };

        restore_storage(store.clone(), temp.path(), &opts).await?;

        assert_eq!(
            store.upload_calls(),
            vec![("media".to_string(), "file-00.txt".to_string(), false)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_preview_writes_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        bucket_with_files(temp.path(), "avatars", 5)?;
        bucket_with_files(temp.path(), "new-bucket", 2)?;
        let store = MemoryStore::new();
        store.seed("avatars", "file-00.txt");
        store.seed("avatars", "file-01.txt");

        let previews = plan_storage(store.clone(), temp.path(), &options(false)).await?;

        assert_eq!(previews.len(), 2);
        assert_eq!(previews[0].bucket, "avatars");
        assert!(previews[0].bucket_exists);
        assert_eq!(previews[0].local_files, 5);
        assert_eq!(previews[0].existing_remote, 2);
        assert_eq!(previews[0].to_upload, 3);
        assert!(!previews[1].bucket_exists);
        assert_eq!(previews[1].to_upload, 2);
        assert!(store.upload_calls().is_empty());
        assert!(store.private_buckets.lock().unwrap().is_empty());
        Ok(())
    }
}
