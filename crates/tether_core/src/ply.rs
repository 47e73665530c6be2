//! ASCII PLY export of paths, planner graphs and atlas charts in 3D.

use std::io::{self, Write};

use crate::planner::PlannerDiagnostics;
use crate::space::{AtlasSpace, Configuration};

/// Vertices with optional edge and triangle elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlyMesh {
    pub vertices: Vec<[f64; 3]>,
    pub edges: Vec<(usize, usize)>,
    pub triangles: Vec<[usize; 3]>,
}

impl PlyMesh {
    pub fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "ply")?;
        writeln!(out, "format ascii 1.0")?;
        writeln!(out, "element vertex {}", self.vertices.len())?;
        for axis in ["x", "y", "z"] {
            writeln!(out, "property double {axis}")?;
        }
        if !self.edges.is_empty() {
            writeln!(out, "element edge {}", self.edges.len())?;
            writeln!(out, "property int vertex1")?;
            writeln!(out, "property int vertex2")?;
        }
        if !self.triangles.is_empty() {
            writeln!(out, "element face {}", self.triangles.len())?;
            writeln!(out, "property list uchar int vertex_indices")?;
        }
        writeln!(out, "end_header")?;

        for [x, y, z] in &self.vertices {
            writeln!(out, "{x} {y} {z}")?;
        }
        for (a, b) in &self.edges {
            writeln!(out, "{a} {b}")?;
        }
        for [a, b, c] in &self.triangles {
            writeln!(out, "3 {a} {b} {c}")?;
        }
        Ok(())
    }
}

fn point3(values: &[f64]) -> io::Result<[f64; 3]> {
    <[f64; 3]>::try_from(values).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("PLY export needs 3D points, got dimension {}", values.len()),
        )
    })
}

/// Polyline through the path states.
pub fn path_mesh(path: &[Configuration]) -> io::Result<PlyMesh> {
    let vertices = path
        .iter()
        .map(|c| point3(c.as_slice()))
        .collect::<io::Result<Vec<_>>>()?;
    let edges = (1..vertices.len()).map(|i| (i - 1, i)).collect();
    Ok(PlyMesh {
        vertices,
        edges,
        triangles: Vec::new(),
    })
}

pub fn graph_mesh(graph: &PlannerDiagnostics) -> io::Result<PlyMesh> {
    let vertices = graph
        .vertices
        .iter()
        .map(|v| point3(v))
        .collect::<io::Result<Vec<_>>>()?;
    Ok(PlyMesh {
        vertices,
        edges: graph.edges.clone(),
        triangles: Vec::new(),
    })
}

/// Each two-dimensional chart becomes a triangle fan from its anchor over the
/// boundary of its polytope.
pub fn atlas_mesh(atlas: &AtlasSpace) -> io::Result<PlyMesh> {
    let mut mesh = PlyMesh::default();
    for chart in atlas.charts() {
        let polygon = chart.boundary_polygon();
        if polygon.len() < 3 {
            continue;
        }
        let center = mesh.vertices.len();
        mesh.vertices.push(point3(chart.anchor().as_slice())?);
        for vertex in &polygon {
            mesh.vertices.push(point3(vertex.as_slice())?);
        }
        let k = polygon.len();
        for i in 0..k {
            mesh.triangles
                .push([center, center + 1 + i, center + 1 + (i + 1) % k]);
        }
    }
    Ok(mesh)
}

pub fn write_path_ply<W: Write>(out: &mut W, path: &[Configuration]) -> io::Result<()> {
    path_mesh(path)?.write(out)
}

pub fn write_graph_ply<W: Write>(out: &mut W, graph: &PlannerDiagnostics) -> io::Result<()> {
    graph_mesh(graph)?.write(out)
}

pub fn write_atlas_ply<W: Write>(out: &mut W, atlas: &AtlasSpace) -> io::Result<()> {
    atlas_mesh(atlas)?.write(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::ExpressionConstraint;
    use crate::space::AtlasSettings;
    use nalgebra::DVector;
    use std::rc::Rc;

    #[test]
    fn path_ply_has_header_vertices_and_edges() {
        let path = vec![
            Configuration::projected(DVector::from_vec(vec![0.0, 0.0, 1.0])),
            Configuration::projected(DVector::from_vec(vec![0.5, 0.0, 1.0])),
        ];
        let mut out = Vec::new();
        write_path_ply(&mut out, &path).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ply");
        assert!(lines.contains(&"element vertex 2"));
        assert!(lines.contains(&"element edge 1"));
        assert!(!text.contains("element face"));
        assert_eq!(lines[lines.len() - 1], "0 1");
    }

    #[test]
    fn planar_points_are_rejected() {
        let path = vec![Configuration::projected(DVector::from_vec(vec![1.0, 0.0]))];
        let err = path_mesh(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn atlas_mesh_fans_each_chart() {
        let constraint =
            ExpressionConstraint::new(&["x", "y", "z"], &[], &["x^2 + y^2 + z^2 - 1"]).unwrap();
        let mut atlas = AtlasSpace::new(Rc::new(constraint), AtlasSettings::default()).unwrap();
        atlas
            .anchor_chart(&DVector::from_vec(vec![0.0, 0.0, 1.0]))
            .unwrap();
        atlas
            .anchor_chart(&DVector::from_vec(vec![0.0, 0.0, -1.0]))
            .unwrap();

        let mesh = atlas_mesh(&atlas).unwrap();
        let per_chart = 1 + chart_polygon_len(&atlas);
        assert_eq!(mesh.vertices.len(), 2 * per_chart);
        assert_eq!(mesh.triangles.len(), 2 * (per_chart - 1));
        assert!(mesh
            .triangles
            .iter()
            .flatten()
            .all(|&i| i < mesh.vertices.len()));
    }

    fn chart_polygon_len(atlas: &AtlasSpace) -> usize {
        atlas.charts()[0].boundary_polygon().len()
    }
}
