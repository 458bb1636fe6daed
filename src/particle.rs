//! Particle records and the particle store.
//!
//! The store is the only owner of particle data. It is sized once at
//! initialization and mutated in place by the integration state each step.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use rand::Rng;

/// One simulated particle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    /// Position inside `[0, box)`.
    pub position: Vec3,
    /// Velocity in units per second.
    pub velocity: Vec3,
    /// RGB colour, 0.0-1.0. Consumed by renderers only.
    pub color: Vec3,
}

/// GPU layout of [`Particle`].
///
/// Each `vec3<f32>` is 16-byte aligned in WGSL storage buffers, so every
/// field carries one padding float. Stride is 48 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ParticleGpu {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub velocity: [f32; 3],
    pub _pad1: f32,
    pub color: [f32; 3],
    pub _pad2: f32,
}

/// WGSL struct matching [`ParticleGpu`].
pub const PARTICLE_WGSL: &str = r#"
struct Particle {
    position: vec3<f32>,
    velocity: vec3<f32>,
    color: vec3<f32>,
};
"#;

impl Particle {
    /// Convert to the padded GPU representation.
    pub fn to_gpu(&self) -> ParticleGpu {
        ParticleGpu {
            position: self.position.to_array(),
            velocity: self.velocity.to_array(),
            color: self.color.to_array(),
            ..Default::default()
        }
    }

    /// Convert back from the GPU representation.
    pub fn from_gpu(gpu: &ParticleGpu) -> Self {
        Self {
            position: Vec3::from_array(gpu.position),
            velocity: Vec3::from_array(gpu.velocity),
            color: Vec3::from_array(gpu.color),
        }
    }
}

/// Fixed-size owner of all particles.
#[derive(Clone, Debug, Default)]
pub struct ParticleStore {
    particles: Vec<Particle>,
}

impl ParticleStore {
    /// Wrap an existing particle list.
    pub fn from_particles(particles: Vec<Particle>) -> Self {
        Self { particles }
    }

    /// Seed `count` particles uniformly inside `[0, box_size)`.
    ///
    /// Velocities are uniformly random unit directions scaled by `speed`.
    /// Colours encode the normalised starting position. This is the only
    /// place randomness enters the simulation.
    pub fn seeded<R: Rng + ?Sized>(count: usize, box_size: Vec3, speed: f32, rng: &mut R) -> Self {
        let particles = (0..count)
            .map(|_| {
                let position = Vec3::new(
                    rng.gen_range(0.0..box_size.x),
                    rng.gen_range(0.0..box_size.y),
                    rng.gen_range(0.0..box_size.z),
                );
                Particle {
                    position,
                    velocity: random_unit_vector(rng) * speed,
                    color: position / box_size,
                }
            })
            .collect();
        Self { particles }
    }

    /// Number of particles.
    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Particle] {
        &self.particles
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    /// Particle by id.
    #[inline]
    pub fn get(&self, id: usize) -> Option<&Particle> {
        self.particles.get(id)
    }

    /// GPU upload image of the whole store.
    pub fn to_gpu(&self) -> Vec<ParticleGpu> {
        self.particles.iter().map(Particle::to_gpu).collect()
    }

    /// Overwrite the store from a GPU download of the same length.
    pub(crate) fn copy_from_gpu(&mut self, gpu: &[ParticleGpu]) {
        debug_assert_eq!(gpu.len(), self.particles.len());
        for (p, g) in self.particles.iter_mut().zip(gpu) {
            *p = Particle::from_gpu(g);
        }
    }
}

/// Uniformly random direction on the unit sphere.
///
/// Samples the cube and rejects points outside the unit ball or too close
/// to the origin, so a zero-length draw is redrawn instead of normalised
/// into NaN.
pub fn random_unit_vector<R: Rng + ?Sized>(rng: &mut R) -> Vec3 {
    loop {
        let v = Vec3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        let len_sq = v.length_squared();
        if len_sq > 1e-12 && len_sq <= 1.0 {
            return v / len_sq.sqrt();
        }
    }
}
