//! Text-tagged state persistence.
//!
//! One record per line, tab-separated fields after the tag, `file://` URIs
//! for paths, CRC32 footer over everything before it:
//!
//! ```text
//! PRELOAD <version> <time>
//! MAP     <seq> <update_time> <offset> <length> <rsv> <file_uri>
//! BADEXE  <update_time> <rsv> <file_uri>
//! EXE     <seq> <update_time> <time> <rsv> <pool> <weighted> <raw> <duration> <file_uri>
//! EXEMAP  <exe_seq> <map_seq> <prob>
//! MARKOV  <a_seq> <b_seq> <time> <ttl[0..3]> <weight[0..3][0..3]>
//! FAMILY  <id> <method> <path1;path2;...>
//! CRC32   <8-hex>
//! ```
//!
//! Saves go through a temp file, fsync and rename; corrupt files are
//! quarantined as `<statefile>.broken.<timestamp>` and the daemon starts
//! with an empty model.

mod read;
pub(crate) mod uri;
mod write;

pub use read::load;
pub use write::save;

use crate::{Exe, Family, Map};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::PathBuf;

/// The reserved field, always written as `-1` and ignored on read.
pub(crate) const RESERVED: i64 = -1;

pub(crate) const TAG_PRELOAD: &str = "PRELOAD";
pub(crate) const TAG_MAP: &str = "MAP";
pub(crate) const TAG_BADEXE: &str = "BADEXE";
pub(crate) const TAG_EXE: &str = "EXE";
pub(crate) const TAG_EXEMAP: &str = "EXEMAP";
pub(crate) const TAG_MARKOV: &str = "MARKOV";
pub(crate) const TAG_FAMILY: &str = "FAMILY";
pub(crate) const TAG_CRC32: &str = "CRC32";

/// The persistent slice of the model, as written to and read from disk.
#[derive(Debug, Default)]
pub struct StateImage {
    /// Virtual clock at save time.
    pub time: u64,
    pub map_seq: u64,
    pub exe_seq: u64,
    pub maps: FxHashSet<Map>,
    pub exes: FxHashMap<PathBuf, Exe>,
    /// path → model time the exe was found too small.
    pub bad_exes: FxHashMap<PathBuf, u64>,
    pub families: FxHashMap<String, Family>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exe::Pool;
    use crate::ExeMap;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn sample_image() -> StateImage {
        let mut image = StateImage {
            time: 1234,
            ..Default::default()
        };

        let libc = Map::new("/usr/lib/libc.so.6", 0, 1_800_000, 10);
        let cat = Map::new("/bin/cat", 0, 65_536, 20);
        for (seq, map) in [&libc, &cat].into_iter().enumerate() {
            map.set_seq(seq as u64 + 1);
            image.map_seq += 1;
        }

        let exe_a = Exe::new("/usr/bin/A");
        exe_a.set_seq(1);
        exe_a.set_pool(Pool::Priority);
        exe_a.set_time(120);
        exe_a.set_update_time(1200);
        exe_a.restore_launch_stats(1.75, 3, 360);

        let exe_b = Exe::new("/usr/bin/B");
        exe_b.set_seq(2);
        exe_b.set_time(60);

        for map in [&libc, &cat] {
            map.inc_ref();
            exe_a.add_exemap(ExeMap::new(map.clone()));
        }
        libc.inc_ref();
        exe_b.add_exemap(ExeMap::new(libc.clone()).with_prob(0.5));

        let markov = exe_a.build_markov_chain_with(&exe_b, 0).unwrap().unwrap();
        let mut weight = [[0u32; 4]; 4];
        weight[0][0] = 2;
        weight[0][1] = 1;
        weight[0][3] = 1;
        markov.restore_stats(42, [10.0, 15.5, 0.0, 8.25], weight);

        image.maps.insert(libc);
        image.maps.insert(cat);
        image.exe_seq = 2;
        image.exes.insert(exe_a.path(), exe_a);
        image.exes.insert(exe_b.path(), exe_b);
        image
            .bad_exes
            .insert(PathBuf::from("/usr/bin/tiny"), 99);

        let mut family = Family::new("editors", crate::family::DiscoveryMethod::Auto);
        family.add_member("/usr/bin/A");
        family.add_member("/usr/bin/B");
        image.families.insert(family.id.clone(), family);

        image
    }

    #[test]
    fn roundtrip_preserves_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("preheat.state");
        let image = sample_image();

        save(&image, &statefile).unwrap();
        let loaded = load(&statefile).unwrap();

        assert_eq!(loaded.time, image.time);

        // exes: identical set with identical persisted stats
        assert_eq!(loaded.exes.len(), 2);
        let a = &loaded.exes[Path::new("/usr/bin/A")];
        assert_eq!(a.time(), 120);
        assert_eq!(a.pool(), Pool::Priority);
        assert_eq!(a.weighted_launches(), 1.75);
        assert_eq!(a.raw_launches(), 3);
        assert_eq!(a.total_duration_sec(), 360);
        assert_eq!(a.exemap_count(), 2);

        let b = &loaded.exes[Path::new("/usr/bin/B")];
        assert_eq!(b.pool(), Pool::Observation);
        assert_eq!(b.exemap_count(), 1);
        let b_exemaps = b.exemaps_snapshot();
        assert_eq!(b_exemaps[0].prob, 0.5);

        // shared library is a single map with refcount 2
        assert_eq!(loaded.maps.len(), 2);
        let probe = Map::new("/usr/lib/libc.so.6", 0, 1_800_000, 0);
        let libc = loaded.maps.get(&probe).unwrap();
        assert_eq!(libc.refcount(), 2);

        // markov tuple preserved
        let markovs = a.markovs_a_side();
        assert_eq!(markovs.len(), 1);
        let (time, ttl, weight) = markovs[0].sojourn_stats();
        assert_eq!(time, 42);
        assert_eq!(ttl, [10.0, 15.5, 0.0, 8.25]);
        assert_eq!(weight[0][0], 2);
        assert_eq!(weight[0][1], 1);
        assert_eq!(weight[0][3], 1);

        // bad exes get another chance on every boot
        assert!(loaded.bad_exes.is_empty());

        // families survive
        let family = &loaded.families["editors"];
        assert_eq!(family.members.len(), 2);
    }

    #[test]
    fn shared_map_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("preheat.state");
        save(&sample_image(), &statefile).unwrap();

        let content = std::fs::read_to_string(&statefile).unwrap();
        let map_lines: Vec<_> = content
            .lines()
            .filter(|l| l.starts_with("MAP\t") && l.contains("1800000"))
            .collect();
        assert_eq!(map_lines.len(), 1);
    }

    #[test]
    fn crc_tamper_quarantines_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("preheat.state");
        save(&sample_image(), &statefile).unwrap();

        // flip one digit inside a MAP length field
        let content = std::fs::read_to_string(&statefile).unwrap();
        let tampered = content.replacen("1800000", "1800001", 1);
        assert_ne!(content, tampered);
        std::fs::write(&statefile, tampered).unwrap();

        let loaded = load(&statefile).unwrap();
        assert!(loaded.exes.is_empty());
        assert!(loaded.maps.is_empty());
        assert!(!statefile.exists());

        let broken: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("preheat.state.broken.")
            })
            .collect();
        assert_eq!(broken.len(), 1);

        // a subsequent save produces a fresh valid file
        save(&StateImage::default(), &statefile).unwrap();
        assert!(load(&statefile).unwrap().exes.is_empty());
    }

    #[test]
    fn missing_footer_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("preheat.state");
        save(&sample_image(), &statefile).unwrap();

        let content = std::fs::read_to_string(&statefile).unwrap();
        let without_footer: String = content
            .lines()
            .filter(|l| !l.starts_with("CRC32"))
            .map(|l| format!("{l}\n"))
            .collect();
        std::fs::write(&statefile, without_footer).unwrap();

        let loaded = load(&statefile).unwrap();
        assert!(loaded.exes.is_empty());
        assert!(!statefile.exists());
    }

    #[test]
    fn absent_file_is_a_clean_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("missing.state");
        let loaded = load(&statefile).unwrap();
        assert!(loaded.exes.is_empty());
        assert_eq!(loaded.time, 0);
    }

    #[test]
    fn newer_major_version_is_rejected_without_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("preheat.state");
        let body = "PRELOAD\t99.0.0\t500\n";
        let crc = crc32fast::hash(body.as_bytes());
        std::fs::write(&statefile, format!("{body}CRC32\t{crc:08X}\n")).unwrap();

        let loaded = load(&statefile).unwrap();
        assert!(loaded.exes.is_empty());
        assert_eq!(loaded.time, 0);
        // a version mismatch is not corruption
        assert!(statefile.exists());
    }

    #[test]
    fn legacy_exe_lines_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("preheat.state");
        let version = env!("CARGO_PKG_VERSION");
        let body = format!(
            "PRELOAD\t{version}\t100\n\
             EXE\t1\t50\t30\t-1\tfile:///usr/bin/old5\n\
             EXE\t2\t50\t30\t-1\t1\tfile:///usr/bin/old6\n"
        );
        let crc = crc32fast::hash(body.as_bytes());
        std::fs::write(&statefile, format!("{body}CRC32\t{crc:08X}\n")).unwrap();

        let loaded = load(&statefile).unwrap();
        assert_eq!(loaded.exes.len(), 2);

        let old5 = &loaded.exes[Path::new("/usr/bin/old5")];
        assert_eq!(old5.pool(), Pool::Observation);
        assert_eq!(old5.raw_launches(), 0);
        assert_eq!(old5.time(), 30);

        let old6 = &loaded.exes[Path::new("/usr/bin/old6")];
        assert_eq!(old6.pool(), Pool::Priority);
        assert_eq!(old6.weighted_launches(), 0.0);
    }

    #[test]
    fn truncated_markov_line_quarantines() {
        let dir = tempfile::tempdir().unwrap();
        let statefile = dir.path().join("preheat.state");
        let version = env!("CARGO_PKG_VERSION");
        let body = format!(
            "PRELOAD\t{version}\t100\n\
             EXE\t1\t50\t30\t-1\t0\t0.0\t0\t0\tfile:///usr/bin/a\n\
             EXE\t2\t50\t30\t-1\t0\t0.0\t0\t0\tfile:///usr/bin/b\n\
             MARKOV\t1\t2\t10\t1.0\t2.0\n"
        );
        let crc = crc32fast::hash(body.as_bytes());
        std::fs::write(&statefile, format!("{body}CRC32\t{crc:08X}\n")).unwrap();

        let loaded = load(&statefile).unwrap();
        assert!(loaded.exes.is_empty());
        assert!(!statefile.exists());
    }
}
