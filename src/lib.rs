pub mod cache;
pub mod dense;
pub mod dimred;
pub mod eigen;
pub mod embed;
pub mod error;
pub mod similarity;
mod utils;

pub use dense::{DataMatrix, Preprocessing};
pub use dimred::pca::{Pca, PcaBuilder, PcaSummary};
pub use dimred::tsne::{Tsne, TsneBuilder, TsneSummary};
pub use dimred::umap::{Umap, UmapBuilder, UmapSummary};
pub use embed::{embed, Embedder, Embedding, EmbeddingJob, EmbeddingMetadata, Method, Visibility};
pub use error::{DimRedError, Result};
pub use utils::CancelToken;
pub use utils::GroupIdentifier;
