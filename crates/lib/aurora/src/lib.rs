pub mod alias_map;
pub mod compute;
pub mod context;
pub mod denoiser;
pub mod environment;
pub mod error;
pub mod frame_data;
pub mod geometry;
pub mod ground_plane;
pub mod image;
pub mod instance;
pub mod light;
pub mod logging;
pub mod material;
pub mod materialx;
pub mod memory_pool;
pub mod options;
pub mod properties;
pub mod render_buffer;
pub mod renderer;
pub mod sampler;
pub mod scene;
pub mod shader_library;
pub mod shaders;
pub mod standard_surface;
pub mod tangent_space;
pub mod task;
pub mod transfer_buffer;
pub mod uniform_buffer;

pub use aurora_backend as backend;

pub use error::RenderError;
pub use geometry::{GeometryDescriptor, VertexData};
pub use image::{ImageDescriptor, ImageFormat};
pub use instance::InstanceDescriptor;
pub use properties::{properties, Properties, PropertyValue};
pub use render_buffer::{RenderBuffer, RenderBufferFormat};
pub use renderer::{create_renderer, Backend, Renderer, RendererConfig};
pub use scene::Scene;
