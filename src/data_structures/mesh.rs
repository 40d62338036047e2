//! Immutable geometry, material and texture resources.
//!
//! These are handed out by the [`crate::resources::ResourceManager`] behind
//! `Arc`s; scene nodes only ever hold shared references to them.

use std::sync::Arc;

use cgmath::{Matrix4, Point3, Transform, Vector3};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl Aabb {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a [f32; 3]>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = Point3::from(*iter.next()?);
        let (min, max) = iter.fold((first, first), |(min, max), p| {
            (
                Point3::new(min.x.min(p[0]), min.y.min(p[1]), min.z.min(p[2])),
                Point3::new(max.x.max(p[0]), max.y.max(p[1]), max.z.max(p[2])),
            )
        });
        Some(Self { min, max })
    }

    /// Bounds of this box after transformation, conservative for rotations.
    pub fn transformed(&self, matrix: &Matrix4<f32>) -> Self {
        let corners = (0..8).map(|i| {
            Point3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            )
        });
        let transformed: Vec<[f32; 3]> = corners
            .map(|c| matrix.transform_point(c).into())
            .collect();
        // eight corners are always present
        Self::from_points(transformed.iter()).unwrap_or(*self)
    }

    pub fn extent(&self) -> Vector3<f32> {
        self.max - self.min
    }
}

/// Triangle geometry. Immutable once created.
#[derive(Debug)]
pub struct Mesh {
    pub id: MeshId,
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
    pub bounds: Aabb,
    pub material: Option<Arc<Material>>,
}

impl Mesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Debug)]
pub struct Material {
    pub id: MaterialId,
    pub name: String,
    pub base_color: [f32; 4],
    pub emission: [f32; 3],
    pub roughness: f32,
    pub metallic: f32,
    pub base_color_texture: Option<Arc<Texture>>,
}

/// Texture metadata; pixel upload is the resource loader's concern.
#[derive(Debug)]
pub struct Texture {
    pub id: TextureId,
    pub name: String,
    pub width: u32,
    pub height: u32,
}
