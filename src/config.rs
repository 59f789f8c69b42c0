//! Store configuration.
//!
//! Every tunable of the store lives in [`StoreConfig`]. Values default to the
//! production settings; tests shrink segment sizes and intervals.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Replication role of this store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerRole {
    /// Master that acknowledges producers without waiting for the slave.
    AsyncMaster,
    /// Master that waits for the slave to acknowledge each write.
    SyncMaster,
    /// Replica; rejects producer writes and applies master bytes.
    Slave,
}

/// When appended bytes are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlushDiskType {
    /// Producers wait for a group commit.
    SyncFlush,
    /// A background thread flushes in page batches or on an interval.
    AsyncFlush,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory; every other store path is derived from it.
    pub store_path_root_dir: PathBuf,
    /// Commit log segment size in bytes.
    pub mapped_file_size_commit_log: usize,
    /// Entries per consume queue segment.
    pub mapped_file_entries_consume_queue: usize,
    /// Hash slots per index file.
    pub max_hash_slot_num: usize,
    /// Entries per index file.
    pub max_index_num: usize,
    /// Largest encoded record accepted by `put_message`.
    pub max_message_size: usize,
    /// Largest serialized properties accepted by `put_message`.
    pub max_properties_size: usize,

    pub flush_disk_type: FlushDiskType,
    pub flush_interval_commit_log_ms: u64,
    pub flush_commit_log_least_pages: usize,
    pub flush_commit_log_thorough_interval_ms: u64,
    pub flush_interval_consume_queue_ms: u64,
    pub flush_consume_queue_least_pages: usize,
    pub flush_consume_queue_thorough_interval_ms: u64,
    pub sync_flush_timeout_ms: u64,
    /// Write lock hold time after which new appends report `OS_PAGECACHE_BUSY`.
    pub os_page_cache_busy_timeout_ms: u64,

    /// Pending dispatch requests above which producers back off for 1 ms.
    pub put_msg_index_high_water: usize,
    pub message_index_enable: bool,

    pub clean_resource_interval_ms: u64,
    /// Hours of the day (`"04"`, `"03;04"`) at which expired files are deleted.
    pub delete_when: String,
    /// Grace window in hours; segments modified more recently are kept.
    pub file_reserved_time_hours: u64,
    pub delete_commit_log_files_interval_ms: u64,
    pub delete_consume_queue_files_interval_ms: u64,
    /// Percentage of disk usage above which space reclaim starts.
    pub disk_max_used_space_ratio: u32,
    /// Usage ratio above which cleanup ignores the grace window.
    pub disk_space_clean_forcibly_ratio: f64,
    /// Usage ratio above which the store is also marked disk-full.
    pub disk_space_warning_level_ratio: f64,
    pub clean_file_forcibly_enable: bool,
    pub max_manual_delete_passes: u32,

    pub max_transfer_bytes_on_message_in_memory: usize,
    pub max_transfer_count_on_message_in_memory: usize,
    pub max_transfer_bytes_on_message_in_disk: usize,
    pub max_transfer_count_on_message_in_disk: usize,
    /// Percentage of physical memory treated as page-cache resident.
    pub access_message_in_memory_max_ratio: u32,

    pub broker_role: BrokerRole,
    pub ha_listen_port: u16,
    /// Master address (`host:port`) a slave connects to.
    pub ha_master_address: Option<String>,
    pub ha_send_heartbeat_interval_ms: u64,
    pub ha_housekeeping_interval_ms: u64,
    pub ha_transfer_batch_size: usize,
    pub ha_slave_fall_behind_max: u64,
    pub ha_reconnect_interval_ms: u64,
    /// Address recorded as the store host in every record.
    pub store_host: String,

    /// Bounded wait for each background service when the store shuts down.
    pub shutdown_grace_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_path_root_dir: PathBuf::from("store"),
            mapped_file_size_commit_log: 1024 * 1024 * 1024,
            mapped_file_entries_consume_queue: 300_000,
            max_hash_slot_num: 5_000_000,
            max_index_num: 5_000_000 * 4,
            max_message_size: 4 * 1024 * 1024,
            max_properties_size: 16 * 1024,

            flush_disk_type: FlushDiskType::AsyncFlush,
            flush_interval_commit_log_ms: 1000,
            flush_commit_log_least_pages: 4,
            flush_commit_log_thorough_interval_ms: 10_000,
            flush_interval_consume_queue_ms: 1000,
            flush_consume_queue_least_pages: 2,
            flush_consume_queue_thorough_interval_ms: 60_000,
            sync_flush_timeout_ms: 5000,
            os_page_cache_busy_timeout_ms: 1000,

            put_msg_index_high_water: 600_000,
            message_index_enable: true,

            clean_resource_interval_ms: 10_000,
            delete_when: "04".to_string(),
            file_reserved_time_hours: 72,
            delete_commit_log_files_interval_ms: 100,
            delete_consume_queue_files_interval_ms: 100,
            disk_max_used_space_ratio: 75,
            disk_space_clean_forcibly_ratio: 0.85,
            disk_space_warning_level_ratio: 0.90,
            clean_file_forcibly_enable: true,
            max_manual_delete_passes: 20,

            max_transfer_bytes_on_message_in_memory: 256 * 1024,
            max_transfer_count_on_message_in_memory: 32,
            max_transfer_bytes_on_message_in_disk: 64 * 1024,
            max_transfer_count_on_message_in_disk: 8,
            access_message_in_memory_max_ratio: 40,

            broker_role: BrokerRole::AsyncMaster,
            ha_listen_port: 10912,
            ha_master_address: None,
            ha_send_heartbeat_interval_ms: 5000,
            ha_housekeeping_interval_ms: 20_000,
            ha_transfer_batch_size: 32 * 1024,
            ha_slave_fall_behind_max: 256 * 1024 * 1024,
            ha_reconnect_interval_ms: 5000,
            store_host: "127.0.0.1:10911".to_string(),

            shutdown_grace_ms: 60_000,
        }
    }
}

impl StoreConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            store_path_root_dir: root.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mapped_file_size_commit_log < 4096 {
            return Err(Error::Config(format!(
                "commit log segment size {} below 4096",
                self.mapped_file_size_commit_log
            )));
        }
        if self.max_message_size + 8 > self.mapped_file_size_commit_log {
            return Err(Error::Config(
                "max_message_size must fit in one commit log segment".to_string(),
            ));
        }
        if self.mapped_file_entries_consume_queue == 0 {
            return Err(Error::Config(
                "mapped_file_entries_consume_queue must be non-zero".to_string(),
            ));
        }
        if self.max_hash_slot_num == 0 || self.max_index_num < 2 {
            return Err(Error::Config("index geometry too small".to_string()));
        }
        if self.delete_when.split(';').any(|h| h.trim().parse::<u8>().is_err()) {
            return Err(Error::Config(format!(
                "delete_when `{}` is not a list of hours",
                self.delete_when
            )));
        }
        if self.broker_role == BrokerRole::Slave && self.ha_master_address.is_none() {
            log::warn!("slave configured without a master address; waiting for an update");
        }
        Ok(())
    }

    pub fn store_path_commit_log(&self) -> PathBuf {
        self.store_path_root_dir.join("commitlog")
    }

    pub fn store_path_consume_queue(&self) -> PathBuf {
        self.store_path_root_dir.join("consumequeue")
    }

    pub fn store_path_index(&self) -> PathBuf {
        self.store_path_root_dir.join("index")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.store_path_root_dir.join("checkpoint")
    }

    pub fn abort_file_path(&self) -> PathBuf {
        self.store_path_root_dir.join("abort")
    }

    /// Consume queue segment size in bytes.
    pub fn mapped_file_size_consume_queue(&self) -> usize {
        self.mapped_file_entries_consume_queue * crate::consume_queue::CQ_STORE_UNIT_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_overrides_merge_with_defaults() {
        let config: StoreConfig = serde_json::from_str(
            r#"{"store_path_root_dir":"/tmp/x","broker_role":"SYNC_MASTER","delete_when":"03;04"}"#,
        )
        .expect("parse");
        assert_eq!(config.broker_role, BrokerRole::SyncMaster);
        assert_eq!(config.flush_disk_type, FlushDiskType::AsyncFlush);
        assert_eq!(config.store_path_commit_log(), PathBuf::from("/tmp/x/commitlog"));
        config.validate().expect("valid");
    }

    #[test]
    fn rejects_bad_delete_window() {
        let config = StoreConfig {
            delete_when: "four".to_string(),
            ..StoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
