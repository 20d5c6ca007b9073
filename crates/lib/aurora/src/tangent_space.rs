//! Generated normals and tangents for meshes that lack them.

use glam::{Vec2, Vec3};

fn triangles(indices: &[u32]) -> impl Iterator<Item = [usize; 3]> + '_ {
    indices
        .chunks_exact(3)
        .map(|tri| [tri[0] as usize, tri[1] as usize, tri[2] as usize])
}

/// Vertex normals from face normals, each weighted by the angle the face
/// subtends at the vertex.
pub fn calculate_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];

    for tri in triangles(indices) {
        let p = tri.map(|i| positions[i]);
        let face_normal = (p[1] - p[0]).cross(p[2] - p[0]).normalize_or_zero();
        if face_normal == Vec3::ZERO {
            continue;
        }

        for corner in 0..3 {
            let e0 = (p[(corner + 1) % 3] - p[corner]).normalize_or_zero();
            let e1 = (p[(corner + 2) % 3] - p[corner]).normalize_or_zero();
            let angle = e0.dot(e1).clamp(-1.0, 1.0).acos();
            normals[tri[corner]] += face_normal * angle;
        }
    }

    // Vertices only touched by degenerate faces get an arbitrary unit normal.
    normals
        .into_iter()
        .map(|n| {
            let n = n.normalize_or_zero();
            if n == Vec3::ZERO {
                Vec3::Z
            } else {
                n
            }
        })
        .collect()
}

/// Tangents from texture coordinates (Lengyel), orthonormalized against the
/// normal with Gram-Schmidt.
pub fn calculate_tangents(
    positions: &[Vec3],
    normals: &[Vec3],
    texcoords: &[Vec2],
    indices: &[u32],
) -> Vec<Vec3> {
    let mut accumulated = vec![Vec3::ZERO; positions.len()];

    for tri in triangles(indices) {
        let p = tri.map(|i| positions[i]);
        let uv = tri.map(|i| texcoords[i]);

        let e1 = p[1] - p[0];
        let e2 = p[2] - p[0];
        let d1 = uv[1] - uv[0];
        let d2 = uv[2] - uv[0];

        let det = d1.x * d2.y - d2.x * d1.y;
        if det.abs() < 1e-12 {
            continue;
        }
        let tangent = (e1 * d2.y - e2 * d1.y) / det;

        for &i in &tri {
            accumulated[i] += tangent;
        }
    }

    accumulated
        .into_iter()
        .zip(normals)
        .map(|(t, &n)| {
            let t = (t - n * n.dot(t)).normalize_or_zero();
            if t == Vec3::ZERO {
                orthonormal_basis(n).0
            } else {
                t
            }
        })
        .collect()
}

/// Pixar's branchless orthonormal basis around `n`.
pub fn orthonormal_basis(n: Vec3) -> (Vec3, Vec3) {
    let sign = if n.z >= 0.0 { 1.0 } else { -1.0 };
    let a = -1.0 / (sign + n.z);
    let b = n.x * n.y * a;
    (
        Vec3::new(1.0 + sign * n.x * n.x * a, sign * b, -sign * n.x),
        Vec3::new(b, sign + n.y * n.y * a, -n.y),
    )
}

pub fn basis_tangents(normals: &[Vec3]) -> Vec<Vec3> {
    normals.iter().map(|&n| orthonormal_basis(n).0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normals_are_unit_and_angle_weighted() {
        // A unit cube corner: three faces meeting at the origin.
        let positions = vec![
            Vec3::ZERO,
            Vec3::X,
            Vec3::Y,
            Vec3::Z,
        ];
        let indices = vec![0, 2, 1, 0, 1, 3, 0, 3, 2];
        let normals = calculate_normals(&positions, &indices);

        assert_eq!(normals.len(), positions.len());
        for n in &normals {
            assert!((n.length() - 1.0).abs() < 1e-5);
        }
        let expected = -Vec3::ONE.normalize();
        assert!((normals[0] - expected).length() < 1e-5);
    }

    #[test]
    fn tangents_follow_texture_u() {
        let positions = vec![Vec3::ZERO, Vec3::X, Vec3::Y];
        let normals = vec![Vec3::Z; 3];
        let texcoords = vec![Vec2::ZERO, Vec2::X, Vec2::Y];
        let tangents = calculate_tangents(&positions, &normals, &texcoords, &[0, 1, 2]);
        for t in tangents {
            assert!((t - Vec3::X).length() < 1e-5);
        }
    }

    #[test]
    fn basis_is_orthonormal() {
        for n in [Vec3::Z, -Vec3::Z, Vec3::new(0.3, -0.4, 0.5).normalize()] {
            let (t, b) = orthonormal_basis(n);
            assert!(t.dot(n).abs() < 1e-5);
            assert!(b.dot(n).abs() < 1e-5);
            assert!(t.dot(b).abs() < 1e-5);
            assert!((t.length() - 1.0).abs() < 1e-5);
        }
    }
}
