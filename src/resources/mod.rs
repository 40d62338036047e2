//! Resource ownership for everything the scene graph references but does not own:
//! meshes, materials and textures. Loading these from disk is the job of an
//! external importer; it hands the decoded data to the `ResourceManager`, which
//! assigns ids and freezes the resources behind `Arc`s.
use std::sync::Arc;

use anyhow::{bail, ensure};

use crate::data_structures::mesh::{Aabb, Material, MaterialId, Mesh, MeshId, Texture, TextureId};

/// Monotonic id source. One allocator per resource kind, owned by the
/// [`ResourceManager`] instead of living in a global.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> anyhow::Result<u32> {
        let id = self.next;
        self.next = match self.next.checked_add(1) {
            Some(next) => next,
            None => bail!("id space exhausted"),
        };
        Ok(id)
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> u32 {
        self.next
    }
}

/// Decoded geometry handed over by an importer.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct MaterialData {
    pub name: String,
    pub base_color: [f32; 4],
    pub emission: [f32; 3],
    pub roughness: f32,
    pub metallic: f32,
    pub base_color_texture: Option<Arc<Texture>>,
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            base_color: [0.8, 0.8, 0.8, 1.0],
            emission: [0.0; 3],
            roughness: 0.5,
            metallic: 0.0,
            base_color_texture: None,
        }
    }
}

#[derive(Debug)]
pub struct ResourceManager {
    mesh_ids: IdAllocator,
    material_ids: IdAllocator,
    texture_ids: IdAllocator,
    max_materials: u32,
    meshes: Vec<Arc<Mesh>>,
    materials: Vec<Arc<Material>>,
    textures: Vec<Arc<Texture>>,
}

impl ResourceManager {
    pub fn new(max_materials: u32) -> Self {
        Self {
            mesh_ids: IdAllocator::new(),
            material_ids: IdAllocator::new(),
            texture_ids: IdAllocator::new(),
            max_materials,
            meshes: Vec::new(),
            materials: Vec::new(),
            textures: Vec::new(),
        }
    }

    pub fn add_mesh(
        &mut self,
        data: MeshData,
        material: Option<Arc<Material>>,
    ) -> anyhow::Result<Arc<Mesh>> {
        ensure!(
            data.indices.len() % 3 == 0,
            "mesh {} has {} indices, which is not a triangle list",
            data.name,
            data.indices.len()
        );
        if let Some(bad) = data
            .indices
            .iter()
            .find(|&&i| i as usize >= data.positions.len())
        {
            bail!(
                "mesh {} references vertex {} but only has {} positions",
                data.name,
                bad,
                data.positions.len()
            );
        }
        let Some(bounds) = Aabb::from_points(data.positions.iter()) else {
            bail!("mesh {} has no vertices", data.name);
        };
        let mesh = Arc::new(Mesh {
            id: MeshId(self.mesh_ids.allocate()?),
            name: data.name,
            positions: data.positions,
            normals: data.normals,
            indices: data.indices,
            bounds,
            material,
        });
        self.meshes.push(mesh.clone());
        Ok(mesh)
    }

    /// Registers a material. Exceeding the configured material capacity is a
    /// configuration error.
    pub fn add_material(&mut self, data: MaterialData) -> anyhow::Result<Arc<Material>> {
        ensure!(
            (self.materials.len() as u32) < self.max_materials,
            "material capacity of {} exceeded while adding {}",
            self.max_materials,
            data.name
        );
        let material = Arc::new(Material {
            id: MaterialId(self.material_ids.allocate()?),
            name: data.name,
            base_color: data.base_color,
            emission: data.emission,
            roughness: data.roughness,
            metallic: data.metallic,
            base_color_texture: data.base_color_texture,
        });
        self.materials.push(material.clone());
        Ok(material)
    }

    pub fn add_texture(&mut self, name: &str, width: u32, height: u32) -> anyhow::Result<Arc<Texture>> {
        let texture = Arc::new(Texture {
            id: TextureId(self.texture_ids.allocate()?),
            name: name.to_string(),
            width,
            height,
        });
        self.textures.push(texture.clone());
        Ok(texture)
    }

    pub fn mesh(&self, id: MeshId) -> Option<&Arc<Mesh>> {
        self.meshes.iter().find(|m| m.id == id)
    }

    pub fn material(&self, id: MaterialId) -> Option<&Arc<Material>> {
        self.materials.iter().find(|m| m.id == id)
    }

    pub fn texture(&self, id: TextureId) -> Option<&Arc<Texture>> {
        self.textures.iter().find(|t| t.id == id)
    }

    pub fn materials(&self) -> &[Arc<Material>] {
        &self.materials
    }

    pub fn max_materials(&self) -> u32 {
        self.max_materials
    }

    /// Lowers the material capacity; already registered materials stay valid
    /// but no new ones are accepted until the count is below the limit.
    pub fn set_max_materials(&mut self, max_materials: u32) {
        self.max_materials = max_materials;
    }
}

/// Unit cube centered at the origin, handy for tests and demo scenes.
pub fn cube_mesh_data(name: &str) -> MeshData {
    let positions = vec![
        [-0.5, -0.5, -0.5],
        [0.5, -0.5, -0.5],
        [0.5, 0.5, -0.5],
        [-0.5, 0.5, -0.5],
        [-0.5, -0.5, 0.5],
        [0.5, -0.5, 0.5],
        [0.5, 0.5, 0.5],
        [-0.5, 0.5, 0.5],
    ];
    let normals = positions
        .iter()
        .map(|p: &[f32; 3]| {
            let len = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            [p[0] / len, p[1] / len, p[2] / len]
        })
        .collect();
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 0, 3, 2,
        4, 5, 6, 4, 6, 7,
        0, 1, 5, 0, 5, 4,
        3, 6, 2, 3, 7, 6,
        0, 4, 7, 0, 7, 3,
        1, 2, 6, 1, 6, 5,
    ];
    MeshData {
        name: name.to_string(),
        positions,
        normals,
        indices,
    }
}
