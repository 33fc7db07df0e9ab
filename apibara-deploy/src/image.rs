/// Multi-stage recipe for the runtime image of an Apibara indexer. The installer stage installs
/// dependencies from the frozen lockfile and builds the project; the runner stage only keeps what
/// `node .apibara/build/start.mjs` needs.
pub const APIBARA_DOCKERFILE: &str = r#"FROM node:22-alpine AS base

# Set up PNPM and corepack
ENV PNPM_HOME="/pnpm"
ENV PATH="$PNPM_HOME:$PATH"
RUN npm install -g corepack@latest && corepack enable

# Add libc6-compat for native package compatibility
RUN apk update
RUN apk add --no-cache libc6-compat

# -------- Dependencies Installer --------
FROM base AS installer

WORKDIR /app

# Copy only dependency declarations first
COPY package.json pnpm-lock.yaml ./
RUN pnpm install --frozen-lockfile

# Copy the rest of the project
COPY . .

# Build the Apibara project
RUN pnpm apibara build

# -------- Final Runtime Image --------
FROM base AS runner

ENV NODE_ENV=production
WORKDIR /app

# Copy dependencies and necessary files
COPY --from=installer /app/node_modules ./node_modules
COPY --from=installer /app/package.json ./package.json
COPY --from=installer /app/.apibara ./.apibara
COPY --from=installer /app/drizzle ./drizzle


# Set working dir to where start.mjs lives
WORKDIR /app

# Start the indexer
ENTRYPOINT ["node", ".apibara/build/start.mjs"]
"#;

pub const GENERATED_DOCKERFILE_NAME: &str = "Dockerfile.gen";

/// A fixed image recipe and the filename it is materialized under in the build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescription {
    filename: &'static str,
    contents: &'static str,
}

impl ImageDescription {
    pub const fn new(filename: &'static str, contents: &'static str) -> Self {
        Self { filename, contents }
    }

    pub const fn apibara() -> Self {
        Self::new(GENERATED_DOCKERFILE_NAME, APIBARA_DOCKERFILE)
    }

    pub fn filename(&self) -> &str {
        self.filename
    }

    pub fn contents(&self) -> &str {
        self.contents
    }
}

impl Default for ImageDescription {
    fn default() -> Self {
        Self::apibara()
    }
}
