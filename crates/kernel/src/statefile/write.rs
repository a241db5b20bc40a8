use super::{
    uri, StateImage, RESERVED, TAG_BADEXE, TAG_CRC32, TAG_EXE, TAG_EXEMAP, TAG_FAMILY, TAG_MAP,
    TAG_MARKOV, TAG_PRELOAD,
};
use crate::{Error, Exe, Map};
use itertools::Itertools;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Serialize the image, checksum included.
pub(crate) fn serialize(image: &StateImage) -> Result<String, Error> {
    let mut out = String::new();

    writeln!(
        out,
        "{TAG_PRELOAD}\t{}\t{}",
        env!("CARGO_PKG_VERSION"),
        image.time
    )
    .expect("writing to a String cannot fail");

    for map in sorted_by_seq(image.maps.iter(), |m: &&Map| m.seq()) {
        let Some(seq) = map.seq() else {
            warn!(path = ?map.path(), "map without sequence number, skipping");
            continue;
        };
        writeln!(
            out,
            "{TAG_MAP}\t{seq}\t{}\t{}\t{}\t{RESERVED}\t{}",
            map.update_time(),
            map.offset(),
            map.length(),
            uri::to_file_uri(map.path()),
        )
        .expect("writing to a String cannot fail");
    }

    for (path, update_time) in image.bad_exes.iter().sorted() {
        writeln!(
            out,
            "{TAG_BADEXE}\t{update_time}\t{RESERVED}\t{}",
            uri::to_file_uri(path),
        )
        .expect("writing to a String cannot fail");
    }

    let exes = sorted_by_seq(image.exes.values(), |e: &&Exe| e.seq());
    for exe in &exes {
        let Some(seq) = exe.seq() else {
            warn!(path = ?exe.path(), "exe without sequence number, skipping");
            continue;
        };
        let update_time = exe.update_time().map(|t| t as i64).unwrap_or(RESERVED);
        writeln!(
            out,
            "{TAG_EXE}\t{seq}\t{update_time}\t{}\t{RESERVED}\t{}\t{:.6}\t{}\t{}\t{}",
            exe.time(),
            exe.pool().as_u8(),
            exe.weighted_launches(),
            exe.raw_launches(),
            exe.total_duration_sec(),
            uri::to_file_uri(&exe.path()),
        )
        .expect("writing to a String cannot fail");
    }

    for exe in &exes {
        let Some(exe_seq) = exe.seq() else {
            continue;
        };
        for exemap in exe
            .exemaps_snapshot()
            .into_iter()
            .sorted_by_key(|em| em.map.seq())
        {
            let Some(map_seq) = exemap.map.seq() else {
                warn!(path = ?exemap.map.path(), "exemap to unregistered map, skipping");
                continue;
            };
            writeln!(out, "{TAG_EXEMAP}\t{exe_seq}\t{map_seq}\t{}", exemap.prob)
                .expect("writing to a String cannot fail");
        }
    }

    for exe in &exes {
        for markov in exe.markovs_a_side() {
            let Some((a_seq, b_seq)) = markov.endpoint_seqs()? else {
                continue;
            };
            let (time, ttl, weight) = markov.sojourn_stats();
            write!(out, "{TAG_MARKOV}\t{a_seq}\t{b_seq}\t{time}")
                .expect("writing to a String cannot fail");
            for value in ttl {
                write!(out, "\t{value}").expect("writing to a String cannot fail");
            }
            for row in weight {
                for value in row {
                    write!(out, "\t{value}").expect("writing to a String cannot fail");
                }
            }
            out.push('\n');
        }
    }

    for family in image.families.values().sorted_by(|a, b| a.id.cmp(&b.id)) {
        let members = family
            .members
            .iter()
            .map(|p| p.display().to_string())
            .join(";");
        writeln!(
            out,
            "{TAG_FAMILY}\t{}\t{}\t{members}",
            family.id,
            family.method.as_u8(),
        )
        .expect("writing to a String cannot fail");
    }

    // checksum covers everything written so far, trailing newline included
    let crc = crc32fast::hash(out.as_bytes());
    writeln!(out, "{TAG_CRC32}\t{crc:08X}").expect("writing to a String cannot fail");

    Ok(out)
}

fn sorted_by_seq<'a, T: 'a>(
    items: impl Iterator<Item = &'a T>,
    seq: impl FnMut(&&'a T) -> Option<u64>,
) -> Vec<&'a T> {
    items.sorted_by_key(seq).collect()
}

/// Atomically write the image to `statefile`.
///
/// The content goes to `<statefile>.tmp` first (created `0600`, refusing to
/// follow symlinks), is fsynced, and renamed over the live file. On any
/// failure the live file is left untouched and the temp file removed.
pub fn save(image: &StateImage, statefile: &Path) -> Result<(), Error> {
    let content = serialize(image)?;

    let mut tmpfile = statefile.as_os_str().to_owned();
    tmpfile.push(".tmp");
    let tmpfile = Path::new(&tmpfile);

    let result = (|| -> Result<(), Error> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_NOFOLLOW)
            .mode(0o600)
            .open(tmpfile)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(tmpfile, statefile)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            info!(path = %statefile.display(), bytes = content.len(), "state saved");
            Ok(())
        }
        Err(err) => {
            debug!(path = %tmpfile.display(), "removing temp state file after failure");
            let _ = std::fs::remove_file(tmpfile);
            Err(err)
        }
    }
}
