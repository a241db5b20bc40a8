use super::{
    uri, StateImage, TAG_BADEXE, TAG_CRC32, TAG_EXE, TAG_EXEMAP, TAG_FAMILY, TAG_MAP, TAG_MARKOV,
    TAG_PRELOAD,
};
use crate::family::{DiscoveryMethod, Family};
use crate::{Error, Exe, ExeMap, Map, Markov};
use rustc_hash::FxHashMap;
use std::path::Path;
use tracing::{info, warn};

const READ_TAG_ERROR: &str = "invalid tag";
const READ_SYNTAX_ERROR: &str = "invalid syntax";
const READ_INDEX_ERROR: &str = "invalid index";
const READ_DUPLICATE_INDEX_ERROR: &str = "duplicate index";
const READ_DUPLICATE_OBJECT_ERROR: &str = "duplicate object";
const READ_CRC_ERROR: &str = "CRC32 checksum mismatch";
const READ_MISSING_CRC_ERROR: &str = "missing or malformed CRC32 footer";

/// Load the persisted model from `statefile`.
///
/// Recoverable problems never fail the daemon: a missing file is a first
/// run, an unreadable file or a version mismatch is warned about, and a
/// corrupt file is renamed to `<statefile>.broken.<timestamp>`. All of
/// these return an empty image.
pub fn load(statefile: &Path) -> Result<StateImage, Error> {
    let content = match std::fs::read_to_string(statefile) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %statefile.display(), "state file not found, first run");
            return Ok(StateImage::default());
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!(path = %statefile.display(), %err, "cannot open state file for reading, continuing without saved state");
            return Ok(StateImage::default());
        }
        Err(err) => {
            warn!(path = %statefile.display(), %err, "cannot read state file, ignoring");
            return Ok(StateImage::default());
        }
    };

    if content.trim().is_empty() {
        return Ok(StateImage::default());
    }

    let body = match verify_crc(&content) {
        Ok(body) => body,
        Err(reason) => {
            quarantine(statefile, reason);
            return Ok(StateImage::default());
        }
    };

    match parse(body) {
        Ok(Some(image)) => {
            info!(
                exes = image.exes.len(),
                maps = image.maps.len(),
                time = image.time,
                "state loaded"
            );
            Ok(image)
        }
        // version mismatch: not corruption, just start over
        Ok(None) => Ok(StateImage::default()),
        Err(ReadError { lineno, reason }) => {
            quarantine(statefile, &format!("line {lineno}: {reason}"));
            Ok(StateImage::default())
        }
    }
}

/// Check the footer and return the checksummed body (which includes the
/// newline before the `CRC32` tag).
fn verify_crc(content: &str) -> Result<&str, &'static str> {
    let marker = format!("{TAG_CRC32}\t");
    let pos = content.rfind(&marker).ok_or(READ_MISSING_CRC_ERROR)?;
    if pos != 0 && !content[..pos].ends_with('\n') {
        return Err(READ_MISSING_CRC_ERROR);
    }
    let footer = content[pos + marker.len()..].trim_end_matches('\n');
    if footer.len() != 8 || content[pos..].matches('\n').count() > 1 {
        return Err(READ_MISSING_CRC_ERROR);
    }
    let stored = u32::from_str_radix(footer, 16).map_err(|_| READ_MISSING_CRC_ERROR)?;

    let body = &content[..pos];
    if crc32fast::hash(body.as_bytes()) != stored {
        return Err(READ_CRC_ERROR);
    }
    Ok(body)
}

struct ReadError {
    lineno: usize,
    reason: String,
}

struct ReadContext {
    image: StateImage,
    maps_by_index: FxHashMap<u64, Map>,
    exes_by_index: FxHashMap<u64, Exe>,
}

/// Parse the body. `Ok(None)` means a version mismatch: ignore the file
/// without quarantining it.
fn parse(body: &str) -> Result<Option<StateImage>, ReadError> {
    let mut rc = ReadContext {
        image: StateImage::default(),
        maps_by_index: FxHashMap::default(),
        exes_by_index: FxHashMap::default(),
    };

    for (lineno, line) in body.lines().enumerate() {
        let lineno = lineno + 1;
        let fail = |reason: &str| ReadError {
            lineno,
            reason: reason.to_owned(),
        };

        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (tag, rest) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));

        if lineno == 1 && tag != TAG_PRELOAD {
            warn!("state file has invalid header, ignoring it");
            return Ok(None);
        }

        match tag {
            TAG_PRELOAD => {
                if lineno != 1 {
                    return Err(fail(READ_SYNTAX_ERROR));
                }
                let mut fields = rest.split_whitespace();
                let version = fields.next().ok_or_else(|| fail(READ_SYNTAX_ERROR))?;
                let time: u64 = parse_field(fields.next()).ok_or_else(|| fail(READ_SYNTAX_ERROR))?;

                let read_major = version_major(version);
                let own_major = version_major(env!("CARGO_PKG_VERSION"));
                if read_major > own_major {
                    warn!("state file is of a newer version, ignoring it");
                    return Ok(None);
                }
                if read_major < own_major {
                    warn!("state file is of an old version that I cannot understand anymore, ignoring it");
                    return Ok(None);
                }
                rc.image.time = time;
            }
            TAG_MAP => read_map(&mut rc, rest).map_err(fail)?,
            TAG_BADEXE => {
                // not read in: bad exes are cleaned up on every start to
                // give them another chance
            }
            TAG_EXE => read_exe(&mut rc, rest).map_err(fail)?,
            TAG_EXEMAP => read_exemap(&mut rc, rest).map_err(fail)?,
            TAG_MARKOV => read_markov(&mut rc, rest).map_err(fail)?,
            TAG_FAMILY => read_family(&mut rc, rest).map_err(fail)?,
            _ => return Err(fail(READ_TAG_ERROR)),
        }
    }

    Ok(Some(rc.image))
}

fn version_major(version: &str) -> u64 {
    version
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
        .unwrap_or(0)
}

fn parse_field<T: std::str::FromStr>(field: Option<&str>) -> Option<T> {
    field.and_then(|f| f.parse().ok())
}

fn read_map(rc: &mut ReadContext, rest: &str) -> Result<(), &'static str> {
    let mut fields = rest.split_whitespace();
    let index: u64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let update_time: i64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let offset: u64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let length: u64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let _rsv: i64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let uri = fields.next().ok_or(READ_SYNTAX_ERROR)?;

    let path = uri::from_file_uri(uri).ok_or(READ_SYNTAX_ERROR)?;
    let map = Map::new(path, offset, length, update_time.max(0) as u64);

    if rc.maps_by_index.contains_key(&index) {
        return Err(READ_DUPLICATE_INDEX_ERROR);
    }
    if rc.maps_by_index.values().any(|existing| *existing == map) {
        return Err(READ_DUPLICATE_OBJECT_ERROR);
    }

    rc.image.map_seq += 1;
    map.set_seq(rc.image.map_seq);
    rc.maps_by_index.insert(index, map);
    Ok(())
}

fn read_exe(rc: &mut ReadContext, rest: &str) -> Result<(), &'static str> {
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // 9 fields: current format with pool and weighted launch counting.
    // 6 fields: pool but no launch counting. 5 fields: the original format.
    let (pool, weighted, raw, duration, uri_ix) = match fields.len() {
        9 => {
            let pool: u8 = fields[4].parse().map_err(|_| READ_SYNTAX_ERROR)?;
            let weighted: f64 = fields[5].parse().map_err(|_| READ_SYNTAX_ERROR)?;
            let raw: u64 = fields[6].parse().map_err(|_| READ_SYNTAX_ERROR)?;
            let duration: u64 = fields[7].parse().map_err(|_| READ_SYNTAX_ERROR)?;
            (pool, weighted, raw, duration, 8)
        }
        6 => {
            let pool: u8 = fields[4].parse().map_err(|_| READ_SYNTAX_ERROR)?;
            (pool, 0.0, 0, 0, 5)
        }
        5 => (0, 0.0, 0, 0, 4),
        _ => return Err(READ_SYNTAX_ERROR),
    };

    let index: u64 = fields[0].parse().map_err(|_| READ_SYNTAX_ERROR)?;
    let update_time: i64 = fields[1].parse().map_err(|_| READ_SYNTAX_ERROR)?;
    let time: u64 = fields[2].parse().map_err(|_| READ_SYNTAX_ERROR)?;
    let path = uri::from_file_uri(fields[uri_ix]).ok_or(READ_SYNTAX_ERROR)?;

    if rc.exes_by_index.contains_key(&index) {
        return Err(READ_DUPLICATE_INDEX_ERROR);
    }
    if rc.image.exes.contains_key(&path) {
        return Err(READ_DUPLICATE_OBJECT_ERROR);
    }

    let exe = Exe::new(&path);
    exe.set_time(time);
    if update_time >= 0 {
        exe.set_update_time(update_time as u64);
    }
    exe.set_pool(pool.into());
    exe.restore_launch_stats(weighted, raw, duration);

    rc.image.exe_seq += 1;
    exe.set_seq(rc.image.exe_seq);
    rc.exes_by_index.insert(index, exe.clone());
    rc.image.exes.insert(path, exe);
    Ok(())
}

fn read_exemap(rc: &mut ReadContext, rest: &str) -> Result<(), &'static str> {
    let mut fields = rest.split_whitespace();
    let exe_index: u64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let map_index: u64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let prob: f64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;

    let exe = rc.exes_by_index.get(&exe_index).ok_or(READ_INDEX_ERROR)?;
    let map = rc.maps_by_index.get(&map_index).ok_or(READ_INDEX_ERROR)?;

    if map.inc_ref() == 1 {
        rc.image.maps.insert(map.clone());
    }
    exe.add_exemap(ExeMap::new(map.clone()).with_prob(prob));
    Ok(())
}

fn read_markov(rc: &mut ReadContext, rest: &str) -> Result<(), &'static str> {
    let mut fields = rest.split_whitespace();
    let a_index: u64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let b_index: u64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let time: u64 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;

    if a_index == b_index {
        return Err(READ_INDEX_ERROR);
    }
    let a = rc.exes_by_index.get(&a_index).ok_or(READ_INDEX_ERROR)?;
    let b = rc.exes_by_index.get(&b_index).ok_or(READ_INDEX_ERROR)?;

    let mut time_to_leave = [0.0f64; 4];
    for slot in &mut time_to_leave {
        *slot = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    }
    let mut weight = [[0u32; 4]; 4];
    for row in &mut weight {
        for slot in row.iter_mut() {
            *slot = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
        }
    }

    let markov = Markov::new(a.for_markov(), b.for_markov());
    markov.restore_stats(time, time_to_leave, weight);
    a.add_markov(markov.clone());
    b.add_markov(markov);
    Ok(())
}

fn read_family(rc: &mut ReadContext, rest: &str) -> Result<(), &'static str> {
    // the member list is the raw final field: split on tabs, not all
    // whitespace, so member paths keep their spaces
    let mut fields = rest.splitn(3, '\t');
    let id = fields.next().filter(|s| !s.is_empty()).ok_or(READ_SYNTAX_ERROR)?;
    let method: u8 = parse_field(fields.next()).ok_or(READ_SYNTAX_ERROR)?;
    let members = fields.next().ok_or(READ_SYNTAX_ERROR)?;

    let mut family = Family::new(id, DiscoveryMethod::from(method));
    for member in members.split(';') {
        let member = member.trim();
        if !member.is_empty() {
            family.add_member(member);
        }
    }
    rc.image.families.insert(family.id.clone(), family);
    Ok(())
}

fn quarantine(statefile: &Path, reason: &str) {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let mut broken = statefile.as_os_str().to_owned();
    broken.push(format!(".broken.{timestamp}"));

    match std::fs::rename(statefile, &broken) {
        Ok(()) => warn!(
            reason,
            broken = %Path::new(&broken).display(),
            "state file corrupt, renamed and starting fresh"
        ),
        Err(err) => warn!(
            reason,
            %err,
            "state file corrupt and could not be renamed, starting fresh"
        ),
    }
}
