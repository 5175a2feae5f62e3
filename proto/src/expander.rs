// Vendored from expander.proto. Regenerate with tonic-build if the
// contract changes.

/// A workload that the option is meant to accommodate.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Workload {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub millicores: i64,
    #[prost(int64, tag = "4")]
    pub memory_bytes: i64,
}

/// Compute shape of a node group's template.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeShape {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub millicores: i64,
    #[prost(int64, tag = "3")]
    pub memory_bytes: i64,
}

/// A candidate (node-group, count) pair.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExpansionOption {
    #[prost(string, tag = "1")]
    pub node_group_id: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub node_count: i32,
    #[prost(string, tag = "3")]
    pub debug: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub pods: ::prost::alloc::vec::Vec<Workload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BestOptionsRequest {
    #[prost(message, repeated, tag = "1")]
    pub options: ::prost::alloc::vec::Vec<ExpansionOption>,
    #[prost(map = "string, message", tag = "2")]
    pub node_map: ::std::collections::HashMap<::prost::alloc::string::String, NodeShape>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BestOptionsResponse {
    #[prost(message, repeated, tag = "1")]
    pub options: ::prost::alloc::vec::Vec<ExpansionOption>,
}

/// Generated client implementations.
pub mod expander_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct ExpanderClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl ExpanderClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> ExpanderClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }

        pub async fn best_options(
            &mut self,
            request: impl tonic::IntoRequest<super::BestOptionsRequest>,
        ) -> std::result::Result<tonic::Response<super::BestOptionsResponse>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/stratus.expander.Expander/BestOptions");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("stratus.expander.Expander", "BestOptions"));
            self.inner.unary(req, path, codec).await
        }
    }
}
