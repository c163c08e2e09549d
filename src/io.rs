//! Map persistence.
//!
//! The on-disk form is a little-endian binary stream: a fixed header with
//! the map parameters, the layer layout, then one record per chunk holding
//! the region coordinate, stamps and every layer's words. Files written by
//! the same layout reload bit-identically.

use std::fs::File;
use std::io::{BufReader, BufWriter, Error, ErrorKind, Read, Write};
use std::path::Path;

use glam::{DVec3, I16Vec3, U8Vec3};

use crate::error::Result;
use crate::layout::{DataType, MapLayout};
use crate::map::{MapFlags, OccupancyMap};

// "AKSM"
const MAP_MAGIC: u32 = 0x414B_534D;
const MAP_VERSION: u32 = 1;

fn write_u32<W: Write>(writer: &mut W, value: u32) -> std::io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_f32<W: Write>(writer: &mut W, value: f32) -> std::io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_f64<W: Write>(writer: &mut W, value: f64) -> std::io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_str<W: Write>(writer: &mut W, value: &str) -> std::io::Result<()> {
    write_u32(writer, value.len() as u32)?;
    writer.write_all(value.as_bytes())
}

fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_str<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let len = read_u32(reader)? as usize;
    if len > 4096 {
        return Err(Error::new(ErrorKind::InvalidData, "unreasonable name length"));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::new(ErrorKind::InvalidData, "name is not UTF-8"))
}

/// Save a map to a file.
pub fn save<P: AsRef<Path>>(map: &OccupancyMap, path: P) -> Result<()> {
    let file = File::create(path).map_err(crate::error::MapError::Serialisation)?;
    let mut writer = BufWriter::new(file);
    write_map(map, &mut writer)?;
    writer.flush().map_err(crate::error::MapError::Serialisation)?;
    Ok(())
}

/// Load a map from a file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<OccupancyMap> {
    let file = File::open(path).map_err(crate::error::MapError::Serialisation)?;
    let mut reader = BufReader::new(file);
    read_map(&mut reader)
}

/// Serialise a map to a writer.
pub fn write_map<W: Write>(map: &OccupancyMap, writer: &mut W) -> Result<()> {
    let mut inner = || -> std::io::Result<()> {
        write_u32(writer, MAP_MAGIC)?;
        write_u32(writer, MAP_VERSION)?;

        write_f64(writer, map.resolution())?;
        let dims = map.region_voxel_dims();
        writer.write_all(&[dims.x, dims.y, dims.z, 0])?;
        let origin = map.origin();
        write_f64(writer, origin.x)?;
        write_f64(writer, origin.y)?;
        write_f64(writer, origin.z)?;

        let params = map.occupancy_params();
        write_f32(writer, params.hit_probability)?;
        write_f32(writer, params.miss_probability)?;
        write_f32(writer, params.threshold_probability)?;
        write_f32(writer, params.min_value)?;
        write_f32(writer, params.max_value)?;
        writer.write_all(&[params.saturate_at_min as u8, params.saturate_at_max as u8])?;
        write_f32(writer, map.sub_voxel_weighting())?;
        write_u64(writer, map.stamp())?;

        let layout = map.layout();
        write_u32(writer, layout.layer_count() as u32)?;
        for layer in layout.layers() {
            write_str(writer, layer.name())?;
            write_u32(writer, layer.members().len() as u32)?;
            for member in layer.members() {
                write_str(writer, &member.name)?;
                writer.write_all(&[member.data_type.id()])?;
                write_u32(writer, member.clear_value)?;
            }
        }

        write_u64(writer, map.region_count() as u64)?;
        for chunk in map.chunks() {
            let region = chunk.region();
            writer.write_all(&region.x.to_le_bytes())?;
            writer.write_all(&region.y.to_le_bytes())?;
            writer.write_all(&region.z.to_le_bytes())?;
            write_u64(writer, chunk.dirty_stamp)?;
            write_f64(writer, chunk.touched_time)?;
            for layer in 0..layout.layer_count() {
                write_u64(writer, chunk.touched_stamp(layer))?;
            }
            let first_valid = chunk.first_valid();
            writer.write_all(&[first_valid.x, first_valid.y, first_valid.z])?;
            for layer in 0..layout.layer_count() {
                for &word in chunk.layer_words(layer) {
                    writer.write_all(&word.to_le_bytes())?;
                }
            }
        }
        Ok(())
    };
    inner()?;
    Ok(())
}

/// Deserialise a map from a reader.
pub fn read_map<R: Read>(reader: &mut R) -> Result<OccupancyMap> {
    let mut inner = || -> std::io::Result<OccupancyMap> {
        if read_u32(reader)? != MAP_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "not a map file"));
        }
        let version = read_u32(reader)?;
        if version != MAP_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unsupported map version {version}"),
            ));
        }

        let resolution = read_f64(reader)?;
        let mut dims_raw = [0u8; 4];
        reader.read_exact(&mut dims_raw)?;
        let dims = U8Vec3::new(dims_raw[0], dims_raw[1], dims_raw[2]);
        let origin = DVec3::new(read_f64(reader)?, read_f64(reader)?, read_f64(reader)?);

        let hit_probability = read_f32(reader)?;
        let miss_probability = read_f32(reader)?;
        let threshold_probability = read_f32(reader)?;
        let min_value = read_f32(reader)?;
        let max_value = read_f32(reader)?;
        let mut saturate = [0u8; 2];
        reader.read_exact(&mut saturate)?;
        let sub_voxel_weighting = read_f32(reader)?;
        let stamp = read_u64(reader)?;

        let layer_count = read_u32(reader)? as usize;
        let mut layout = MapLayout::new();
        for _ in 0..layer_count {
            let name = read_str(reader)?;
            let layer = layout.add_layer(&name);
            let member_count = read_u32(reader)? as usize;
            for _ in 0..member_count {
                let member_name = read_str(reader)?;
                let mut dtype = [0u8; 1];
                reader.read_exact(&mut dtype)?;
                let data_type = DataType::from_id(dtype[0])
                    .ok_or_else(|| Error::new(ErrorKind::InvalidData, "unknown member type"))?;
                let clear_value = read_u32(reader)?;
                layer.add_member(&member_name, data_type, clear_value);
            }
        }

        let mut map = OccupancyMap::new(resolution, dims, MapFlags::NONE);
        map.set_origin(origin);
        map.set_hit_probability(hit_probability);
        map.set_miss_probability(miss_probability);
        map.set_threshold_probability(threshold_probability);
        map.set_min_voxel_value(min_value);
        map.set_max_voxel_value(max_value);
        map.set_saturate_at_min(saturate[0] != 0);
        map.set_saturate_at_max(saturate[1] != 0);
        map.set_sub_voxel_weighting(sub_voxel_weighting);
        map.set_layout(layout);
        map.restore_stamp(stamp);

        let chunk_count = read_u64(reader)?;
        let layer_count = map.layout().layer_count();
        for _ in 0..chunk_count {
            let mut coord = [0u8; 6];
            reader.read_exact(&mut coord)?;
            let region = I16Vec3::new(
                i16::from_le_bytes([coord[0], coord[1]]),
                i16::from_le_bytes([coord[2], coord[3]]),
                i16::from_le_bytes([coord[4], coord[5]]),
            );
            let dirty_stamp = read_u64(reader)?;
            let touched_time = read_f64(reader)?;
            let mut touched_stamps = Vec::with_capacity(layer_count);
            for _ in 0..layer_count {
                touched_stamps.push(read_u64(reader)?);
            }
            let mut first_valid = [0u8; 3];
            reader.read_exact(&mut first_valid)?;

            let chunk = map
                .region_chunk_mut(region, true)
                .expect("chunk created on demand");
            chunk.touched_time = touched_time;
            for (layer, &touch) in touched_stamps.iter().enumerate() {
                if touch > 0 {
                    chunk.touch_layer(layer, touch);
                }
            }
            chunk.dirty_stamp = dirty_stamp;
            for layer in 0..layer_count {
                let words = chunk.layer_words_mut(layer);
                let mut buf = [0u8; 4];
                for word in words.iter_mut() {
                    reader.read_exact(&mut buf)?;
                    *word = u32::from_le_bytes(buf);
                }
            }
            chunk.restore_first_valid(U8Vec3::new(
                first_valid[0],
                first_valid[1],
                first_valid[2],
            ));
        }

        Ok(map)
    };
    Ok(inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::integrate::RayFlags;
    use glam::DVec3;

    fn populated_map() -> OccupancyMap {
        let mut map = OccupancyMap::new(
            0.1,
            U8Vec3::splat(32),
            MapFlags::VOXEL_MEAN | MapFlags::SUB_VOXEL_POSITION,
        );
        let rays = [
            DVec3::ZERO,
            DVec3::new(0.45, 0.2, 0.1),
            DVec3::ZERO,
            DVec3::new(-2.0, 1.0, 3.3),
        ];
        map.integrate_rays(&rays, RayFlags::NONE);
        map
    }

    #[test]
    fn test_round_trip() {
        let map = populated_map();
        let file = tempfile::NamedTempFile::new().expect("temp file");
        save(&map, file.path()).expect("save");
        let loaded = load(file.path()).expect("load");

        assert_eq!(loaded.resolution(), map.resolution());
        assert_eq!(loaded.region_count(), map.region_count());
        assert_eq!(loaded.stamp(), map.stamp());
        assert_eq!(loaded.layout().layer_count(), map.layout().layer_count());
        assert!(loaded.sub_voxel_enabled());

        for chunk in map.chunks() {
            let other = loaded
                .region_chunk(chunk.region())
                .expect("chunk survives round trip");
            assert_eq!(other.first_valid(), chunk.first_valid());
            assert_eq!(other.dirty_stamp, chunk.dirty_stamp);
            for layer in 0..map.layout().layer_count() {
                assert_eq!(other.layer_words(layer), chunk.layer_words(layer));
            }
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes: Vec<u8> = Vec::new();
        write_u32(&mut bytes, 0xDEAD_BEEF).expect("write");
        write_u32(&mut bytes, MAP_VERSION).expect("write");
        let result = read_map(&mut bytes.as_slice());
        assert!(result.is_err());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let map = populated_map();
        let mut bytes: Vec<u8> = Vec::new();
        write_map(&map, &mut bytes).expect("write");
        bytes.truncate(bytes.len() / 2);
        assert!(read_map(&mut bytes.as_slice()).is_err());
    }
}
