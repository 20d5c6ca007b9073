use crate::{
    error::RenderError,
    properties::{FromPropertyValue, PropertyValue},
};
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::{collections::HashMap, fmt::Write as _, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformType {
    Bool,
    Int,
    Float,
    Float2,
    Float3,
    Float4,
    Mat4,
}

impl UniformType {
    pub fn size(self) -> usize {
        match self {
            UniformType::Bool | UniformType::Int | UniformType::Float => 4,
            UniformType::Float2 => 8,
            UniformType::Float3 => 12,
            UniformType::Float4 => 16,
            UniformType::Mat4 => 64,
        }
    }

    pub fn alignment(self) -> usize {
        match self {
            UniformType::Float4 | UniformType::Mat4 => 16,
            _ => 4,
        }
    }

    /// Bools are stored as 32-bit integers.
    pub fn hlsl_type(self) -> &'static str {
        match self {
            UniformType::Bool | UniformType::Int => "int",
            UniformType::Float => "float",
            UniformType::Float2 => "float2",
            UniformType::Float3 => "float3",
            UniformType::Float4 => "float4",
            UniformType::Mat4 => "float4x4",
        }
    }

    fn matches(self, value: &PropertyValue) -> bool {
        matches!(
            (self, value),
            (UniformType::Bool, PropertyValue::Bool(_))
                | (UniformType::Int, PropertyValue::Int(_))
                | (UniformType::Float, PropertyValue::Float(_))
                | (UniformType::Float2, PropertyValue::Float2(_))
                | (UniformType::Float3, PropertyValue::Float3(_))
                | (UniformType::Float4, PropertyValue::Float4(_))
                | (UniformType::Mat4, PropertyValue::Mat4(_))
        )
    }

    fn name(self) -> &'static str {
        match self {
            UniformType::Bool => "bool",
            UniformType::Int => "int",
            UniformType::Float => "float",
            UniformType::Float2 => "float2",
            UniformType::Float3 => "float3",
            UniformType::Float4 => "float4",
            UniformType::Mat4 => "mat4",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UniformField {
    /// Name used by the property API.
    pub name: String,
    /// Name used in generated shader code.
    pub variable_name: String,
    pub ty: UniformType,
}

impl UniformField {
    pub fn new(name: &str, variable_name: &str, ty: UniformType) -> Self {
        Self {
            name: name.to_owned(),
            variable_name: variable_name.to_owned(),
            ty,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldLocation {
    pub offset: usize,
    /// Index into `UniformBufferDefinition::fields`, padding included.
    pub index: usize,
}

/// Packed layout of a list of fields.
///
/// Fields are naturally aligned, a field of up to 16 bytes never straddles a
/// 16-byte boundary, and the total size is a multiple of 16. Gaps are filled
/// with `int` padding fields, which take part in the generated shader struct.
#[derive(Debug, PartialEq, Eq)]
pub struct UniformBufferDefinition {
    fields: Vec<UniformField>,
    offsets: Vec<usize>,
    is_padding: Vec<bool>,
    locations: HashMap<String, FieldLocation>,
    size: usize,
}

impl UniformBufferDefinition {
    pub fn new(fields: &[UniformField]) -> Arc<Self> {
        let mut layout = Self {
            fields: Vec::with_capacity(fields.len()),
            offsets: Vec::with_capacity(fields.len()),
            is_padding: Vec::with_capacity(fields.len()),
            locations: HashMap::with_capacity(fields.len()),
            size: 0,
        };

        let mut offset = 0usize;
        let mut padding_count = 0usize;

        let mut pad = |layout: &mut Self, offset: &mut usize| {
            layout.fields.push(UniformField::new(
                &format!("_padding{}", padding_count),
                &format!("_padding{}", padding_count),
                UniformType::Int,
            ));
            layout.offsets.push(*offset);
            layout.is_padding.push(true);
            padding_count += 1;
            *offset += 4;
        };

        for field in fields {
            assert!(
                !layout.locations.contains_key(&field.name),
                "duplicate uniform field {:?}",
                field.name
            );

            let size = field.ty.size();
            while offset % field.ty.alignment() != 0 {
                pad(&mut layout, &mut offset);
            }

            if size <= 16 && offset / 16 != (offset + size - 1) / 16 {
                while offset % 16 != 0 {
                    pad(&mut layout, &mut offset);
                }
            }

            layout.locations.insert(
                field.name.clone(),
                FieldLocation {
                    offset,
                    index: layout.fields.len(),
                },
            );
            layout.fields.push(field.clone());
            layout.offsets.push(offset);
            layout.is_padding.push(false);
            offset += size;
        }

        while offset % 16 != 0 {
            pad(&mut layout, &mut offset);
        }

        layout.size = offset;
        Arc::new(layout)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Every field, padding included, in layout order.
    pub fn fields(&self) -> impl Iterator<Item = (&UniformField, usize)> {
        self.fields.iter().zip(self.offsets.iter().copied())
    }

    /// Declared fields only.
    pub fn declared_fields(&self) -> impl Iterator<Item = (&UniformField, usize)> {
        self.fields()
            .zip(self.is_padding.iter())
            .filter(|(_, is_padding)| !**is_padding)
            .map(|(field, _)| field)
    }

    pub fn location(&self, name: &str) -> Option<FieldLocation> {
        self.locations.get(name).copied()
    }

    pub fn field(&self, name: &str) -> Option<&UniformField> {
        self.location(name).map(|loc| &self.fields[loc.index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.locations.contains_key(name)
    }

    pub fn generate_hlsl_struct(&self, struct_name: &str) -> String {
        let mut code = format!("struct {}\n{{\n", struct_name);
        for (field, _) in self.fields() {
            let _ = writeln!(
                code,
                "    {} {};",
                field.ty.hlsl_type(),
                field.variable_name
            );
        }
        code.push_str("};\n");
        code
    }

    /// One `{prefix}_{variable}(ByteAddressBuffer, int)` accessor per declared field.
    pub fn generate_byte_address_buffer_accessors(&self, prefix: &str) -> String {
        self.generate_accessors(prefix, "ByteAddressBuffer")
    }

    /// Accessors over any HLSL type with `ByteAddressBuffer`-style `Load*` methods.
    pub fn generate_accessors(&self, prefix: &str, buffer_type: &str) -> String {
        let mut code = String::new();

        for (field, offset) in self.declared_fields() {
            let name = format!("{}_{}", prefix, field.variable_name);
            let ty = field.ty.hlsl_type();

            let body = match field.ty {
                UniformType::Bool => format!("return buf.Load(offset + {}) != 0;", offset),
                UniformType::Int => format!("return int(buf.Load(offset + {}));", offset),
                UniformType::Float => format!("return asfloat(buf.Load(offset + {}));", offset),
                UniformType::Float2 => {
                    format!("return asfloat(buf.Load2(offset + {}));", offset)
                }
                UniformType::Float3 => {
                    format!("return asfloat(buf.Load3(offset + {}));", offset)
                }
                UniformType::Float4 => {
                    format!("return asfloat(buf.Load4(offset + {}));", offset)
                }
                UniformType::Mat4 => {
                    let mut body = String::new();
                    for row in 0..4 {
                        let _ = writeln!(
                            body,
                            "    float4 r{} = asfloat(buf.Load4(offset + {}));",
                            row,
                            offset + row * 16
                        );
                    }
                    body.push_str(
                        "    return float4x4(\n        \
                         r0.x, r0.y, r0.z, r0.w,\n        \
                         r1.x, r1.y, r1.z, r1.w,\n        \
                         r2.x, r2.y, r2.z, r2.w,\n        \
                         r3.x, r3.y, r3.z, r3.w);",
                    );
                    body
                }
            };

            let return_type = if field.ty == UniformType::Bool {
                "bool"
            } else {
                ty
            };

            if field.ty == UniformType::Mat4 {
                let _ = writeln!(
                    code,
                    "{} {}({} buf, int offset)\n{{\n{}\n}}\n",
                    return_type, name, buffer_type, body
                );
            } else {
                let _ = writeln!(
                    code,
                    "{} {}({} buf, int offset)\n{{\n    {}\n}}\n",
                    return_type, name, buffer_type, body
                );
            }
        }

        code
    }
}

/// CPU copy of a uniform block, laid out by a `UniformBufferDefinition`.
#[derive(Clone, Debug)]
pub struct UniformBuffer {
    definition: Arc<UniformBufferDefinition>,
    defaults: Arc<Vec<PropertyValue>>,
    data: Vec<u8>,
}

impl UniformBuffer {
    /// `defaults` parallels the declared fields of `definition`.
    pub fn new(definition: Arc<UniformBufferDefinition>, defaults: Arc<Vec<PropertyValue>>) -> Self {
        assert_eq!(
            definition.declared_fields().count(),
            defaults.len(),
            "uniform defaults must parallel the declared fields"
        );

        let mut buffer = Self {
            data: vec![0; definition.size()],
            definition,
            defaults,
        };

        let declared: Vec<(String, PropertyValue)> = buffer
            .definition
            .declared_fields()
            .zip(buffer.defaults.iter())
            .map(|((field, _), value)| (field.name.clone(), value.clone()))
            .collect();

        for (name, value) in declared {
            if let Err(err) = buffer.set(&name, &value) {
                panic!("invalid default for uniform {:?}: {}", name, err);
            }
        }

        buffer
    }

    pub fn definition(&self) -> &Arc<UniformBufferDefinition> {
        &self.definition
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definition.contains(name)
    }

    /// Fails exactly when `set(name, value)` would.
    pub fn check(&self, name: &str, value: &PropertyValue) -> Result<FieldLocation, RenderError> {
        let location = self
            .definition
            .location(name)
            .ok_or_else(|| RenderError::UnknownProperty {
                name: name.to_owned(),
            })?;
        let ty = self.definition.fields[location.index].ty;

        if !ty.matches(value) {
            return Err(RenderError::PropertyType {
                name: name.to_owned(),
                expected: ty.name(),
                found: value.kind().name(),
            });
        }
        Ok(location)
    }

    pub fn set(&mut self, name: &str, value: &PropertyValue) -> Result<(), RenderError> {
        let location = self.check(name, value)?;

        let mut words = [0u32; 16];
        let count = match value {
            PropertyValue::Bool(v) => {
                words[0] = *v as u32;
                1
            }
            PropertyValue::Int(v) => {
                words[0] = *v as u32;
                1
            }
            PropertyValue::Float(v) => {
                words[0] = v.to_bits();
                1
            }
            PropertyValue::Float2(v) => write_floats(&mut words, &v.to_array()),
            PropertyValue::Float3(v) => write_floats(&mut words, &v.to_array()),
            PropertyValue::Float4(v) => write_floats(&mut words, &v.to_array()),
            // Row-major, matching the generated `float4x4` accessor.
            PropertyValue::Mat4(v) => write_floats(&mut words, &v.transpose().to_cols_array()),
            _ => unreachable!(),
        };

        let bytes: &[u8] = bytemuck::cast_slice(&words[..count]);
        self.data[location.offset..location.offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// The stored value, or `None` for an unknown name.
    pub fn get_value(&self, name: &str) -> Option<PropertyValue> {
        let location = self.definition.location(name)?;
        let ty = self.definition.fields[location.index].ty;
        let bytes = &self.data[location.offset..location.offset + ty.size()];
        let word = |i: usize| u32::from_le_bytes([
            bytes[i * 4],
            bytes[i * 4 + 1],
            bytes[i * 4 + 2],
            bytes[i * 4 + 3],
        ]);
        let float = |i: usize| f32::from_bits(word(i));

        Some(match ty {
            UniformType::Bool => PropertyValue::Bool(word(0) != 0),
            UniformType::Int => PropertyValue::Int(word(0) as i32),
            UniformType::Float => PropertyValue::Float(float(0)),
            UniformType::Float2 => PropertyValue::Float2(Vec2::new(float(0), float(1))),
            UniformType::Float3 => PropertyValue::Float3(Vec3::new(float(0), float(1), float(2))),
            UniformType::Float4 => {
                PropertyValue::Float4(Vec4::new(float(0), float(1), float(2), float(3)))
            }
            UniformType::Mat4 => {
                let mut rows = [0.0f32; 16];
                for (i, value) in rows.iter_mut().enumerate() {
                    *value = float(i);
                }
                PropertyValue::Mat4(Mat4::from_cols_array(&rows).transpose())
            }
        })
    }

    /// Typed read; `T::default()` when the name is unknown or holds another type.
    pub fn get<T: FromPropertyValue + Default>(&self, name: &str) -> T {
        self.get_value(name)
            .and_then(|value| T::from_property_value(&value))
            .unwrap_or_default()
    }

    /// Restores the default value of `name`.
    pub fn reset(&mut self, name: &str) -> Result<(), RenderError> {
        let index = self
            .definition
            .declared_fields()
            .position(|(field, _)| field.name == name)
            .ok_or_else(|| RenderError::UnknownProperty {
                name: name.to_owned(),
            })?;
        let default = self.defaults[index].clone();
        self.set(name, &default)
    }
}

fn write_floats(words: &mut [u32; 16], values: &[f32]) -> usize {
    for (word, value) in words.iter_mut().zip(values) {
        *word = value.to_bits();
    }
    values.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<UniformField> {
        vec![
            UniformField::new("base", "base", UniformType::Float),
            UniformField::new("base_color", "baseColor", UniformType::Float3),
            UniformField::new("thin_walled", "thinWalled", UniformType::Bool),
            UniformField::new("uv_offset", "uvOffset", UniformType::Float2),
            UniformField::new("emission_color", "emissionColor", UniformType::Float3),
            UniformField::new("tint", "tint", UniformType::Float4),
            UniformField::new("transform", "transform", UniformType::Mat4),
            UniformField::new("count", "count", UniformType::Int),
        ]
    }

    fn defaults() -> Arc<Vec<PropertyValue>> {
        Arc::new(vec![
            PropertyValue::Float(0.8),
            PropertyValue::Float3(Vec3::ONE),
            PropertyValue::Bool(false),
            PropertyValue::Float2(Vec2::ZERO),
            PropertyValue::Float3(Vec3::ZERO),
            PropertyValue::Float4(Vec4::ONE),
            PropertyValue::Mat4(Mat4::IDENTITY),
            PropertyValue::Int(3),
        ])
    }

    #[test]
    fn fields_never_straddle_16_byte_boundaries() {
        let definition = UniformBufferDefinition::new(&fields());

        for (field, offset) in definition.fields() {
            assert_eq!(offset % field.ty.alignment(), 0, "{:?}", field);
            let size = field.ty.size();
            if size <= 16 {
                assert_eq!(offset / 16, (offset + size - 1) / 16, "{:?}", field);
            }
        }
        assert_eq!(definition.size() % 16, 0);

        // The float3 after a float fits in the rest of the first register;
        // the second float3 would straddle 32 and is pushed there.
        assert_eq!(definition.location("base").unwrap().offset, 0);
        assert_eq!(definition.location("base_color").unwrap().offset, 4);
        assert_eq!(definition.location("thin_walled").unwrap().offset, 16);
        assert_eq!(definition.location("uv_offset").unwrap().offset, 20);
        assert_eq!(definition.location("emission_color").unwrap().offset, 32);
        assert_eq!(definition.location("tint").unwrap().offset, 48);
        assert_eq!(definition.location("transform").unwrap().offset, 64);
        assert_eq!(definition.location("count").unwrap().offset, 128);
        assert_eq!(definition.size(), 144);
        assert_eq!(definition.fields().count(), fields().len() + 5);
    }

    #[test]
    fn set_get_and_reset() {
        let mut buffer = UniformBuffer::new(UniformBufferDefinition::new(&fields()), defaults());

        assert_eq!(buffer.get::<f32>("base"), 0.8);
        assert_eq!(buffer.get::<i32>("count"), 3);

        let color = Vec3::new(1.0, 0.5, 0.2);
        buffer.set("base_color", &color.into()).unwrap();
        assert_eq!(buffer.get::<Vec3>("base_color"), color);

        let transform = Mat4::from_cols_array(&[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0,
        ]);
        buffer.set("transform", &transform.into()).unwrap();
        assert_eq!(buffer.get::<Mat4>("transform"), transform);
        // Row-major storage: the first stored row is the first element of each column.
        let offset = buffer.definition().location("transform").unwrap().offset;
        let first: f32 = *bytemuck::from_bytes(&buffer.data()[offset + 4..offset + 8]);
        assert_eq!(first, 5.0);

        buffer.set("thin_walled", &true.into()).unwrap();
        assert!(buffer.get::<bool>("thin_walled"));

        buffer.reset("base_color").unwrap();
        assert_eq!(buffer.get::<Vec3>("base_color"), Vec3::ONE);

        // Unknown names and mismatched types read as the type's default.
        assert_eq!(buffer.get::<f32>("missing"), 0.0);
        assert_eq!(buffer.get::<f32>("count"), 0.0);
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let mut buffer = UniformBuffer::new(UniformBufferDefinition::new(&fields()), defaults());
        let before = buffer.data().to_vec();

        let err = buffer.set("base_color", &PropertyValue::Float(1.0));
        assert!(matches!(err, Err(RenderError::PropertyType { .. })));
        assert!(matches!(
            buffer.set("nope", &PropertyValue::Float(1.0)),
            Err(RenderError::UnknownProperty { .. })
        ));
        assert_eq!(buffer.data(), &before[..]);
    }

    #[test]
    fn generated_code_covers_every_field() {
        let definition = UniformBufferDefinition::new(&fields());
        let hlsl = definition.generate_hlsl_struct("MaterialConstants");
        assert!(hlsl.starts_with("struct MaterialConstants"));
        assert!(hlsl.contains("float3 baseColor;"));
        assert!(hlsl.contains("float4x4 transform;"));
        assert!(hlsl.contains("int _padding0;"));

        let accessors = definition.generate_byte_address_buffer_accessors("Material");
        assert!(accessors.contains("float3 Material_baseColor(ByteAddressBuffer buf, int offset)"));
        assert!(accessors.contains("asfloat(buf.Load3(offset + 4))"));
        assert!(accessors.contains("bool Material_thinWalled"));
        assert!(accessors.contains("buf.Load4(offset + 112)"));
        assert!(!accessors.contains("buf.Load4(offset + 128)"));
        assert!(!accessors.contains("_padding"));
    }
}
